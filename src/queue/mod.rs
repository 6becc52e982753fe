//! Request/reply client for the detection queue server.
//!
//! The exchange is strictly synchronous: one request, then one reply. When a
//! reply does not arrive in time the channel is unusable (the server may still
//! answer the old request), so the client throws the connection away, opens a
//! fresh one and re-sends the identical request. After `retries` attempts the
//! server is considered gone for good and [`QueueError::RetriesExhausted`] is
//! returned; the worker treats that as fatal. A cancel flag set while retrying
//! ends the request early with [`QueueError::Interrupted`].

pub mod zmtp;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_REQUEST_RETRIES: u32 = 10;

/// Operation selector understood by the queue server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Return the head of the queue without removing it.
    Peek = 0,
    /// Return the head of the queue and remove it atomically.
    Pop = 1,
    /// Remove the head of the queue.
    Delete = 2,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Wire form: the opcode as JSON text.
    pub fn encode(self) -> Vec<u8> {
        self.code().to_string().into_bytes()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Peek => "peek",
            Self::Pop => "pop",
            Self::Delete => "delete",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Status codes the server sends instead of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    /// No data available.
    Empty,
    /// Head of the queue removed.
    Removed,
}

/// Server reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// A batch payload, still undecoded.
    Batch(Value),
    Status(QueueStatus),
}

impl Reply {
    pub fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| QueueError::MalformedReply(format!("not JSON: {}", e)))?;
        match value {
            Value::Object(_) => Ok(Self::Batch(value)),
            Value::Number(ref n) => match n.as_i64() {
                Some(0) => Ok(Self::Status(QueueStatus::Empty)),
                Some(1) => Ok(Self::Status(QueueStatus::Removed)),
                _ => Err(QueueError::MalformedReply(format!(
                    "unknown status code {}",
                    n
                ))),
            },
            other => Err(QueueError::MalformedReply(format!(
                "expected object or status code, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The server never answered within the retry budget. Fatal.
    #[error("queue server {endpoint} did not answer after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },
    /// The server answered with something that is neither a batch nor a
    /// status code. The exchange itself completed.
    #[error("malformed reply from queue server: {0}")]
    MalformedReply(String),
    /// Cancelled between attempts; no reply was received.
    #[error("request to queue server {endpoint} cancelled after {attempts} attempts")]
    Interrupted { endpoint: String, attempts: u32 },
}

impl QueueError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Granularity of cancellable waits.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// One request/reply connection.
pub trait ReqChannel {
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the reply. `Ok(None)` on timeout.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Tear the connection down without lingering on unsent data.
    fn close(self);
}

/// Opens fresh channels to one fixed endpoint.
pub trait Connector {
    type Channel: ReqChannel;

    fn endpoint(&self) -> String;

    fn connect(&self, timeout: Duration) -> Result<Self::Channel>;
}

/// TCP connector speaking ZMTP REQ.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Channel = zmtp::ReqSocket;

    fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn connect(&self, timeout: Duration) -> Result<Self::Channel> {
        zmtp::ReqSocket::connect(&self.endpoint(), timeout)
    }
}

impl ReqChannel for zmtp::ReqSocket {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        zmtp::ReqSocket::send(self, payload)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.recv(timeout)
    }

    fn close(self) {
        zmtp::ReqSocket::close(self)
    }
}

/// Request/reply engine with bounded retry and reconnect.
pub struct QueueClient<C: Connector> {
    connector: C,
    channel: Option<C::Channel>,
    timeout: Duration,
    retries: u32,
}

impl<C: Connector> QueueClient<C> {
    /// `retries` is the total number of attempts per request, first one
    /// included. Values below 1 are raised to 1.
    pub fn new(connector: C, timeout: Duration, retries: u32) -> Self {
        Self {
            connector,
            channel: None,
            timeout,
            retries: retries.max(1),
        }
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Send `opcode` and wait for the reply, reconnecting and re-sending on
    /// timeout until the retry budget is spent.
    pub fn request(&mut self, opcode: Opcode) -> Result<Reply, QueueError> {
        self.request_until(opcode, &AtomicBool::new(false))
    }

    /// Like [`request`](Self::request), but gives up with
    /// [`QueueError::Interrupted`] once `cancel` is set. The flag is checked
    /// after every failed attempt, so at most one timeout passes after it is
    /// raised.
    pub fn request_until(
        &mut self,
        opcode: Opcode,
        cancel: &AtomicBool,
    ) -> Result<Reply, QueueError> {
        let payload = opcode.encode();
        log::debug!("sending request {}", opcode);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.exchange(&payload) {
                Ok(Some(bytes)) => return Reply::decode(&bytes),
                Ok(None) => {
                    log::warn!(
                        "no response from queue server {} (attempt {}/{})",
                        self.endpoint(),
                        attempt,
                        self.retries
                    );
                }
                Err(e) => {
                    log::warn!(
                        "request to queue server {} failed (attempt {}/{}): {:#}",
                        self.endpoint(),
                        attempt,
                        self.retries,
                        e
                    );
                    // An immediate failure still costs a full timeout window.
                    wait_unless(cancel, self.timeout.saturating_sub(started.elapsed()));
                }
            }

            self.disconnect();
            if cancel.load(Ordering::SeqCst) {
                log::info!(
                    "request {} to queue server {} cancelled",
                    opcode,
                    self.endpoint()
                );
                return Err(QueueError::Interrupted {
                    endpoint: self.endpoint(),
                    attempts: attempt,
                });
            }
            if attempt >= self.retries {
                log::error!(
                    "queue server {} seems to be offline, abandoning",
                    self.endpoint()
                );
                return Err(QueueError::RetriesExhausted {
                    endpoint: self.endpoint(),
                    attempts: attempt,
                });
            }
            log::info!(
                "reconnecting to queue server {} and resending {} (retry {}/{})",
                self.endpoint(),
                opcode,
                attempt,
                self.retries - 1
            );
        }
    }

    /// Drop the current connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    fn exchange(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                log::debug!("connecting to queue server {}", self.endpoint());
                self.connector.connect(self.timeout)?
            }
        };
        let channel = self.channel.insert(channel);
        channel.send(payload)?;
        channel.recv_timeout(self.timeout)
    }
}

/// Sleep for `duration` or until `cancel` is set.
fn wait_unless(cancel: &AtomicBool, duration: Duration) {
    let until = Instant::now() + duration;
    while !cancel.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= until {
            break;
        }
        std::thread::sleep((until - now).min(CANCEL_POLL));
    }
}

impl<C: Connector> Drop for QueueClient<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
