use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use zeroize::Zeroizing;

use super::template::{check_node_id, Template, TemplateValues};
use super::ResultSink;
use crate::message::OutboundMessage;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HttpSinkConfig {
    pub url: Template,
    pub method: String,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub timeout: Duration,
    pub include_crops: bool,
    pub hostname: String,
}

/// Sends each result as a JSON request body.
///
/// Only `200 OK` counts as delivered.
pub struct HttpSink {
    agent: ureq::Agent,
    config: HttpSinkConfig,
    authorization: Option<Zeroizing<String>>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let authorization = config.username.as_ref().map(|user| {
            let password = config.password.as_deref().map(String::as_str).unwrap_or("");
            let credentials = Zeroizing::new(format!("{}:{}", user, password));
            Zeroizing::new(format!("Basic {}", B64.encode(credentials.as_bytes())))
        });
        log::info!(
            "HTTP sink: {} {} (auth: {}, timeout: {:?})",
            config.method,
            config.url,
            authorization.is_some(),
            config.timeout
        );
        Self {
            agent,
            config,
            authorization,
        }
    }

    /// Target URL for `message`. Node ids that would alter the URL's
    /// structure are refused.
    pub fn url_for(&self, message: &OutboundMessage) -> Result<String> {
        check_node_id(&message.node_id)?;
        Ok(self.config.url.render(&TemplateValues {
            hostname: &self.config.hostname,
            node_id: &message.node_id,
            filename: &message.filename(),
        }))
    }

    /// Send `message`. Failures are logged and reported as `false`.
    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        match self.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "HTTP delivery of result from {} failed: {:#}",
                    message.node_id,
                    e
                );
                false
            }
        }
    }

    fn send(&self, message: &OutboundMessage) -> Result<()> {
        let url = self.url_for(message)?;
        let body = message.render(self.config.include_crops)?;
        self.send_body(&url, &body)
    }

    fn send_body(&self, url: &str, body: &[u8]) -> Result<()> {
        let mut request = self
            .agent
            .request(&self.config.method, url)
            .set("Content-Type", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.set("Authorization", auth.as_str());
        }
        match request.send_bytes(body) {
            Ok(response) if response.status() == 200 => Ok(()),
            Ok(response) => Err(anyhow!(
                "{} {} returned status {}",
                self.config.method,
                url,
                response.status()
            )),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(
                "{} {} returned status {}",
                self.config.method,
                url,
                code
            )),
            Err(e) => Err(e).with_context(|| format!("{} {}", self.config.method, url)),
        }
    }
}

impl ResultSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn deliver(&mut self, message: &OutboundMessage) -> Result<()> {
        self.send(message)
    }
}
