//! Minimal ZMTP 3.0 peer over a plain TCP stream.
//!
//! Only what a REQ/REP exchange with the queue server needs is implemented:
//! the NULL security mechanism, the `READY` handshake and multipart message
//! frames. Command frames arriving between messages are skipped.
//!
//! Greeting layout (64 bytes):
//!
//! ```text
//! 0xFF, 8 x 0x00, 0x7F | major, minor | mechanism (20, NUL padded) | as-server | 31 x 0x00
//! ```

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

pub const GREETING_LEN: usize = 64;
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 0;
const MECHANISM_NULL: &[u8] = b"NULL";

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// ZeroMQ socket type announced in the `READY` handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Req,
    Rep,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Rep => "REP",
        }
    }

    fn accepts_peer(&self, peer: &str) -> bool {
        match self {
            Self::Req => matches!(peer, "REP" | "ROUTER"),
            Self::Rep => matches!(peer, "REQ" | "DEALER"),
        }
    }
}

/// One wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub more: bool,
    pub command: bool,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn message(body: &[u8], more: bool) -> Self {
        Self {
            more,
            command: false,
            body: body.to_vec(),
        }
    }

    pub fn command(name: &str, data: &[u8]) -> Self {
        let mut body = Vec::with_capacity(1 + name.len() + data.len());
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(data);
        Self {
            more: false,
            command: true,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.more {
            flags |= FLAG_MORE;
        }
        if self.command {
            flags |= FLAG_COMMAND;
        }
        let len = self.body.len();
        let mut out = Vec::with_capacity(len + 9);
        if len > u8::MAX as usize {
            out.push(flags | FLAG_LONG);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        } else {
            out.push(flags);
            out.push(len as u8);
        }
        out.extend_from_slice(&self.body);
        out
    }

    /// Split a command frame into its name and data.
    pub fn command_parts(&self) -> Option<(&str, &[u8])> {
        if !self.command {
            return None;
        }
        let (&name_len, rest) = self.body.split_first()?;
        let name_len = name_len as usize;
        if rest.len() < name_len {
            return None;
        }
        let name = std::str::from_utf8(&rest[..name_len]).ok()?;
        Some((name, &rest[name_len..]))
    }
}

pub fn greeting(as_server: bool) -> [u8; GREETING_LEN] {
    let mut g = [0u8; GREETING_LEN];
    g[0] = 0xFF;
    g[9] = 0x7F;
    g[10] = VERSION_MAJOR;
    g[11] = VERSION_MINOR;
    g[12..12 + MECHANISM_NULL.len()].copy_from_slice(MECHANISM_NULL);
    g[32] = as_server as u8;
    g
}

fn check_greeting(g: &[u8; GREETING_LEN]) -> Result<()> {
    if g[0] != 0xFF || g[9] != 0x7F {
        bail!("peer is not speaking ZMTP (bad signature)");
    }
    if g[10] < VERSION_MAJOR {
        bail!("peer speaks ZMTP {}.{}, need 3.x", g[10], g[11]);
    }
    let mechanism = &g[12..32];
    let name_end = mechanism.iter().position(|&b| b == 0).unwrap_or(mechanism.len());
    if &mechanism[..name_end] != MECHANISM_NULL {
        bail!(
            "unsupported security mechanism '{}'",
            String::from_utf8_lossy(&mechanism[..name_end])
        );
    }
    Ok(())
}

/// Encode ZMTP metadata properties (`READY` command data).
pub fn encode_properties(props: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in props {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Decode ZMTP metadata properties. Property names are case-insensitive and
/// returned lowercased.
pub fn decode_properties(mut data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut props = Vec::new();
    while !data.is_empty() {
        let name_len = data[0] as usize;
        data = &data[1..];
        if data.len() < name_len + 4 {
            bail!("truncated property name");
        }
        let name = String::from_utf8_lossy(&data[..name_len]).to_lowercase();
        data = &data[name_len..];
        let value_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < value_len {
            bail!("truncated value of property '{}'", name);
        }
        props.push((name, data[..value_len].to_vec()));
        data = &data[value_len..];
    }
    Ok(props)
}

/// A connected, handshaken ZMTP peer.
pub struct ZmtpSocket {
    stream: TcpStream,
    peer: SocketAddr,
    kind: SocketType,
}

impl ZmtpSocket {
    /// Connect to `endpoint` (`host:port`) and complete the handshake within
    /// `timeout`.
    pub fn connect(endpoint: &str, kind: SocketType, timeout: Duration) -> Result<Self> {
        let addrs: Vec<SocketAddr> = endpoint
            .to_socket_addrs()
            .with_context(|| format!("resolve queue endpoint {}", endpoint))?
            .collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::handshake(stream, kind, timeout, false),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e).with_context(|| format!("connect to {}", endpoint)),
            None => Err(anyhow!("queue endpoint {} resolved to no address", endpoint)),
        }
    }

    /// Complete the handshake on an accepted connection.
    pub fn accept(stream: TcpStream, kind: SocketType, timeout: Duration) -> Result<Self> {
        Self::handshake(stream, kind, timeout, true)
    }

    fn handshake(
        stream: TcpStream,
        kind: SocketType,
        timeout: Duration,
        as_server: bool,
    ) -> Result<Self> {
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let peer = stream.peer_addr().context("peer address")?;
        let mut socket = Self { stream, peer, kind };
        let deadline = Instant::now() + timeout;

        socket
            .stream
            .write_all(&greeting(as_server))
            .context("send greeting")?;
        let mut peer_greeting = [0u8; GREETING_LEN];
        if !socket.read_exact_by(&mut peer_greeting, deadline)? {
            bail!("timed out waiting for greeting from {}", peer);
        }
        check_greeting(&peer_greeting)?;

        let ready = Frame::command(
            "READY",
            &encode_properties(&[("Socket-Type", kind.as_str().as_bytes())]),
        );
        socket
            .stream
            .write_all(&ready.encode())
            .context("send READY")?;

        loop {
            let Some(frame) = socket.read_frame(deadline)? else {
                bail!("timed out waiting for READY from {}", peer);
            };
            match frame.command_parts() {
                Some(("READY", data)) => {
                    let props = decode_properties(data)?;
                    let peer_type = props
                        .iter()
                        .find(|(name, _)| name == "socket-type")
                        .map(|(_, value)| String::from_utf8_lossy(value).to_string())
                        .ok_or_else(|| anyhow!("READY from {} lacks Socket-Type", peer))?;
                    if !kind.accepts_peer(&peer_type) {
                        bail!(
                            "{} socket cannot talk to {} peer at {}",
                            kind.as_str(),
                            peer_type,
                            peer
                        );
                    }
                    break;
                }
                Some(("ERROR", data)) => {
                    let reason = data.get(1..).map(String::from_utf8_lossy).unwrap_or_default();
                    bail!("peer {} rejected handshake: {}", peer, reason);
                }
                _ => bail!("unexpected frame from {} during handshake", peer),
            }
        }
        log::debug!("ZMTP {} handshake with {} complete", kind.as_str(), peer);
        Ok(socket)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn kind(&self) -> SocketType {
        self.kind
    }

    /// Send one multipart message.
    pub fn send_message(&mut self, parts: &[&[u8]]) -> Result<()> {
        let mut wire = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            wire.extend(Frame::message(part, i + 1 < parts.len()).encode());
        }
        self.stream
            .write_all(&wire)
            .with_context(|| format!("send message to {}", self.peer))
    }

    /// Receive one multipart message. `Ok(None)` when nothing complete arrived
    /// within `timeout`; the stream must then be discarded.
    pub fn recv_message(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>> {
        let deadline = Instant::now() + timeout;
        let mut parts = Vec::new();
        loop {
            let Some(frame) = self.read_frame(deadline)? else {
                return Ok(None);
            };
            if frame.command {
                if let Some((name, _)) = frame.command_parts() {
                    log::debug!("skipping ZMTP command {} from {}", name, self.peer);
                }
                continue;
            }
            let more = frame.more;
            parts.push(frame.body);
            if !more {
                return Ok(Some(parts));
            }
        }
    }

    /// Drop the connection without waiting for unsent data.
    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn read_frame(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        let mut flags = [0u8; 1];
        if !self.read_exact_by(&mut flags, deadline)? {
            return Ok(None);
        }
        let flags = flags[0];
        let len = if flags & FLAG_LONG != 0 {
            let mut size = [0u8; 8];
            if !self.read_exact_by(&mut size, deadline)? {
                return Ok(None);
            }
            u64::from_be_bytes(size)
        } else {
            let mut size = [0u8; 1];
            if !self.read_exact_by(&mut size, deadline)? {
                return Ok(None);
            }
            size[0] as u64
        };
        if len > MAX_FRAME_BYTES {
            bail!("frame of {} bytes from {} exceeds limit", len, self.peer);
        }
        let mut body = vec![0u8; len as usize];
        if !self.read_exact_by(&mut body, deadline)? {
            return Ok(None);
        }
        Ok(Some(Frame {
            more: flags & FLAG_MORE != 0,
            command: flags & FLAG_COMMAND != 0,
            body,
        }))
    }

    /// Fill `buf` before `deadline`. Returns `false` on timeout.
    fn read_exact_by(&mut self, buf: &mut [u8], deadline: Instant) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.stream
                .set_read_timeout(Some(deadline - now))
                .context("set read timeout")?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => bail!("connection closed by {}", self.peer),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e).with_context(|| format!("read from {}", self.peer)),
            }
        }
        Ok(true)
    }
}

/// REQ side: every request travels behind an empty delimiter frame.
pub struct ReqSocket {
    inner: ZmtpSocket,
}

impl ReqSocket {
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            inner: ZmtpSocket::connect(endpoint, SocketType::Req, timeout)?,
        })
    }

    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        self.inner.send_message(&[b"", body])
    }

    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some(parts) = self.inner.recv_message(timeout)? else {
            return Ok(None);
        };
        strip_delimiter(parts).map(Some)
    }

    pub fn close(self) {
        self.inner.close();
    }
}

/// REP side, used by fake queue servers.
pub struct RepSocket {
    inner: ZmtpSocket,
}

impl RepSocket {
    pub fn accept(stream: TcpStream, timeout: Duration) -> Result<Self> {
        Ok(Self {
            inner: ZmtpSocket::accept(stream, SocketType::Rep, timeout)?,
        })
    }

    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some(parts) = self.inner.recv_message(timeout)? else {
            return Ok(None);
        };
        strip_delimiter(parts).map(Some)
    }

    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        self.inner.send_message(&[b"", body])
    }
}

fn strip_delimiter(parts: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let mut parts = parts.into_iter();
    match parts.next() {
        Some(first) if first.is_empty() => {}
        _ => bail!("message is missing the empty delimiter frame"),
    }
    let body: Vec<u8> = parts.flatten().collect();
    Ok(body)
}
