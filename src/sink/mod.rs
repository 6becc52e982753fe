//! Result delivery.
//!
//! Every enabled sink gets every result message. Sinks are independent: one
//! failing never stops the others, and nothing is retried or queued.

mod file;
mod http;
mod mqtt;
mod template;
mod tls;

use anyhow::{Context, Result};

use crate::config::WorkerConfig;
use crate::message::OutboundMessage;

pub use file::FileSink;
pub use http::{HttpSink, HttpSinkConfig, DEFAULT_HTTP_TIMEOUT};
pub use mqtt::{MqttSink, MqttSinkConfig};
pub use template::{check_node_id, local_hostname, Template, TemplateValues, PLACEHOLDERS};
pub use tls::{ClientIdentity, TlsMaterials};

/// Destination for encoded result messages.
pub trait ResultSink: Send {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    fn deliver(&mut self, message: &OutboundMessage) -> Result<()>;
}

/// Outcome of delivering one message to one sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkOutcome {
    pub sink: &'static str,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub outcomes: Vec<SinkOutcome>,
}

impl FanoutReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(SinkOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

/// Ordered set of enabled sinks.
#[derive(Default)]
pub struct SinkFanout {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ResultSink>) {
        log::info!("result sink '{}' enabled", sink.name());
        self.sinks.push(sink);
    }

    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Hand `message` to every sink in order.
    pub fn deliver(&mut self, message: &OutboundMessage) -> FanoutReport {
        let mut report = FanoutReport::default();
        for sink in &mut self.sinks {
            let error = match sink.deliver(message) {
                Ok(()) => {
                    log::debug!("delivered result of {} to {}", message.node_id, sink.name());
                    None
                }
                Err(e) => {
                    log::error!(
                        "failed to deliver result of node {} to {} sink: {:#}",
                        message.node_id,
                        sink.name(),
                        e
                    );
                    Some(format!("{:#}", e))
                }
            };
            report.outcomes.push(SinkOutcome {
                sink: sink.name(),
                error,
            });
        }
        report
    }
}

/// Construct every sink the configuration enables, in file, MQTT, HTTP order.
pub fn build_sinks(cfg: &WorkerConfig) -> Result<SinkFanout> {
    let mut fanout = SinkFanout::new();
    let host_only = |raw: &str| -> Result<String> {
        Ok(Template::parse(raw)?.render(&TemplateValues {
            hostname: &cfg.hostname,
            node_id: "",
            filename: "",
        }))
    };

    if cfg.file.enabled {
        fanout.push(Box::new(FileSink::new(
            cfg.file.base_dir.clone(),
            cfg.file.save_crops,
        )));
    }

    if cfg.mqtt.enabled {
        let mqtt = &cfg.mqtt;
        let sink = MqttSink::connect(MqttSinkConfig {
            host: mqtt.host.clone(),
            port: mqtt.port,
            topic: Template::parse(&mqtt.topic).context("output.mqtt.topic")?,
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            use_tls: mqtt.use_tls,
            tls: mqtt.tls_materials()?,
            client_id: host_only(&mqtt.client_id).context("output.mqtt.client_id")?,
            include_crops: mqtt.include_crops,
            hostname: cfg.hostname.clone(),
        })?;
        fanout.push(Box::new(sink));
    }

    if cfg.http.enabled {
        let http = &cfg.http;
        fanout.push(Box::new(HttpSink::new(HttpSinkConfig {
            url: Template::parse(&http.url).context("output.http.url")?,
            method: http.method.clone(),
            username: http.username.clone(),
            password: http.password.clone(),
            timeout: http.timeout,
            include_crops: http.include_crops,
            hostname: cfg.hostname.clone(),
        })));
    }

    if fanout.is_empty() {
        log::warn!("no result sink enabled, results will be discarded");
    }
    Ok(fanout)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records delivered messages as JSON values.
    pub struct RecordingSink {
        pub name: &'static str,
        pub fail: bool,
        pub delivered: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl RecordingSink {
        pub fn new(name: &'static str, fail: bool) -> (Self, Arc<Mutex<Vec<serde_json::Value>>>) {
            let delivered = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    name,
                    fail,
                    delivered: delivered.clone(),
                },
                delivered,
            )
        }
    }

    impl ResultSink for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        fn deliver(&mut self, message: &OutboundMessage) -> Result<()> {
            if self.fail {
                anyhow::bail!("{} is down", self.name);
            }
            self.delivered.lock().unwrap().push(message.to_value(true)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use crate::message::ResultBatch;
    use chrono::DateTime;

    fn message() -> OutboundMessage {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:22:00Z").unwrap();
        ResultBatch::new("node-7", ts).into_message().unwrap()
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let (first, first_seen) = RecordingSink::new("first", false);
        let (broken, _) = RecordingSink::new("broken", true);
        let (last, last_seen) = RecordingSink::new("last", false);
        let mut fanout = SinkFanout::new().with(first).with(broken).with(last);

        let report = fanout.deliver(&message());
        assert!(!report.all_ok());
        let failed: Vec<_> = report.failures().map(|o| o.sink).collect();
        assert_eq!(failed, vec!["broken"]);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(last_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_fanout_reports_success() {
        let mut fanout = SinkFanout::new();
        assert!(fanout.is_empty());
        assert!(fanout.deliver(&message()).all_ok());
    }
}
