use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, ConnectionError, Event, MqttOptions};
use zeroize::Zeroizing;

use super::template::{check_node_id, Template, TemplateValues};
use super::tls::TlsMaterials;
use super::ResultSink;
use crate::message::OutboundMessage;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Outgoing request buffer; a full buffer fails the publish.
const REQUEST_CAPACITY: usize = 10;

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub topic: Template,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub use_tls: bool,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub include_crops: bool,
    pub hostname: String,
}

/// Network event loop for the client, run on its own thread.
struct MqttRuntime {
    client: Option<Client>,
    closing: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection, endpoint: String) -> Self {
        let closing = Arc::new(AtomicBool::new(false));
        let stop = closing.clone();
        let handle = std::thread::spawn(move || loop {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(ConnectionError::RequestsDone) => return,
                    Err(e) => {
                        if stop.load(Ordering::SeqCst) {
                            return;
                        }
                        log::warn!("MQTT connection to {} error: {}", endpoint, e);
                        break;
                    }
                }
            }
            let resume_at = std::time::Instant::now() + RECONNECT_DELAY;
            while std::time::Instant::now() < resume_at {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            log::info!("reconnecting to MQTT broker {}", endpoint);
        });

        Self {
            client: Some(client),
            closing,
            connection_handle: Some(handle),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("MQTT client already disconnected"))
    }

    /// Stop the event loop. Dropping the client closes the request channel,
    /// which ends the loop once queued requests are flushed.
    fn disconnect(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                log::debug!("MQTT disconnect: {}", e);
            }
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Publishes each result to a (templated) topic.
///
/// Publishing only queues the message for the event loop thread and never
/// waits on the network.
pub struct MqttSink {
    runtime: MqttRuntime,
    topic: Template,
    include_crops: bool,
    hostname: String,
}

impl MqttSink {
    pub fn connect(config: MqttSinkConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = &config.username {
            let password = config.password.as_deref().map(String::as_str).unwrap_or("");
            options.set_credentials(user, password);
        }
        options.set_transport(
            config
                .tls
                .transport(config.use_tls)
                .context("configure MQTT transport")?,
        );

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let endpoint = format!("{}:{}", config.host, config.port);
        log::info!(
            "MQTT sink: broker {} topic {} (TLS: {}, auth: {})",
            endpoint,
            config.topic,
            config.use_tls,
            config.username.is_some()
        );
        Ok(Self {
            runtime: MqttRuntime::new(client, connection, endpoint),
            topic: config.topic,
            include_crops: config.include_crops,
            hostname: config.hostname,
        })
    }

    /// Topic for `message`. Node ids carrying topic separators or
    /// wildcards are refused.
    pub fn topic_for(&self, message: &OutboundMessage) -> Result<String> {
        check_node_id(&message.node_id)?;
        Ok(self.topic.render(&TemplateValues {
            hostname: &self.hostname,
            node_id: &message.node_id,
            filename: &message.filename(),
        }))
    }

    pub fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let topic = self.topic_for(message)?;
        let payload = message.render(self.include_crops)?;
        self.runtime
            .client()?
            .try_publish(topic.clone(), QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("queue MQTT publish to '{}'", topic))?;
        log::debug!("queued result of {} for topic {}", message.node_id, topic);
        Ok(())
    }
}

impl ResultSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, message: &OutboundMessage) -> Result<()> {
        self.publish(message)
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.runtime.disconnect();
    }
}
