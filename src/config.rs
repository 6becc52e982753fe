use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::detect::{ModelBackend, ModelSettings};
use crate::sink::{local_hostname, Template, TlsMaterials};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
const DEFAULT_QUEUE_HOST: &str = "127.0.0.1";
const DEFAULT_QUEUE_PORT: u16 = 5557;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;
const DEFAULT_REQUEST_RETRIES: u32 = 10;
const DEFAULT_IDLE_BACKOFF_MS: u64 = 5000;
const DEFAULT_BASE_DIR: &str = "output";
const DEFAULT_MQTT_PORT: u16 = 1883;
const MQTT_TLS_PORT: u16 = 8883;
const DEFAULT_MQTT_CLIENT_ID: &str = "pollinator-worker-${hostname}";
const DEFAULT_HTTP_METHOD: &str = "POST";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const HTTP_METHODS: [&str; 5] = ["POST", "PUT", "PATCH", "GET", "DELETE"];

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    hostname: Option<String>,
    model: Option<ModelConfigFile>,
    queue: Option<QueueConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    weights_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    margin: Option<u32>,
    multi_label: Option<bool>,
    multi_label_iou_threshold: Option<f32>,
    max_detections: Option<usize>,
    class_names: Option<Vec<String>>,
    augment: Option<bool>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    host: Option<String>,
    port: Option<u16>,
    request_timeout_ms: Option<u64>,
    request_retries: Option<u32>,
    idle_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    file: Option<FileOutputFile>,
    mqtt: Option<MqttOutputFile>,
    http: Option<HttpOutputFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FileOutputFile {
    store_file: Option<bool>,
    base_dir: Option<PathBuf>,
    save_crops: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttOutputFile {
    transmit_mqtt: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    client_id: Option<String>,
    include_crops: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpOutputFile {
    transmit_http: Option<bool>,
    url: Option<String>,
    method: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_ms: Option<u64>,
    include_crops: Option<bool>,
}

/// Worker configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Value substituted for `${hostname}`.
    pub hostname: String,
    pub model: ModelSettings,
    pub queue: QueueSettings,
    pub file: FileOutputSettings,
    pub mqtt: MqttOutputSettings,
    pub http: HttpOutputSettings,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub request_retries: u32,
    pub idle_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct FileOutputSettings {
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub save_crops: bool,
}

#[derive(Debug, Clone)]
pub struct MqttOutputSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub client_id: String,
    pub include_crops: bool,
}

#[derive(Debug, Clone)]
pub struct HttpOutputSettings {
    pub enabled: bool,
    pub url: String,
    pub method: String,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub timeout: Duration,
    pub include_crops: bool,
}

impl WorkerConfig {
    /// Read `path`, fill defaults, apply `POLLINATOR_*` overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let file_cfg = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WorkerConfigFile) -> Result<Self> {
        let hostname = file.hostname.unwrap_or_else(local_hostname);

        let model_file = file.model.unwrap_or_default();
        let defaults = ModelSettings::default();
        let backend = match model_file.backend.as_deref() {
            Some(name) => name.parse::<ModelBackend>()?,
            None => defaults.backend,
        };
        let model = ModelSettings {
            backend,
            weights_path: model_file.weights_path.unwrap_or(defaults.weights_path),
            confidence_threshold: model_file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            iou_threshold: model_file.iou_threshold.unwrap_or(defaults.iou_threshold),
            margin: model_file.margin.unwrap_or(defaults.margin),
            multi_label: model_file.multi_label.unwrap_or(defaults.multi_label),
            multi_label_iou_threshold: model_file
                .multi_label_iou_threshold
                .unwrap_or(defaults.multi_label_iou_threshold),
            max_detections: model_file.max_detections.unwrap_or(defaults.max_detections),
            class_names: model_file.class_names.unwrap_or(defaults.class_names),
            augment: model_file.augment.unwrap_or(defaults.augment),
            input_size: model_file.input_size.unwrap_or(defaults.input_size),
        };

        let queue_file = file.queue.unwrap_or_default();
        let queue = QueueSettings {
            host: queue_file
                .host
                .unwrap_or_else(|| DEFAULT_QUEUE_HOST.to_string()),
            port: queue_file.port.unwrap_or(DEFAULT_QUEUE_PORT),
            request_timeout: Duration::from_millis(
                queue_file
                    .request_timeout_ms
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            request_retries: queue_file
                .request_retries
                .unwrap_or(DEFAULT_REQUEST_RETRIES),
            idle_backoff: Duration::from_millis(
                queue_file.idle_backoff_ms.unwrap_or(DEFAULT_IDLE_BACKOFF_MS),
            ),
        };

        let output = file.output.unwrap_or_default();
        let file_out = output.file.unwrap_or_default();
        let file = FileOutputSettings {
            enabled: file_out.store_file.unwrap_or(false),
            base_dir: file_out
                .base_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
            save_crops: file_out.save_crops.unwrap_or(true),
        };

        let mqtt_out = output.mqtt.unwrap_or_default();
        let mqtt_port = mqtt_out.port.unwrap_or(DEFAULT_MQTT_PORT);
        let mqtt = MqttOutputSettings {
            enabled: mqtt_out.transmit_mqtt.unwrap_or(false),
            host: mqtt_out.host.unwrap_or_default(),
            port: mqtt_port,
            topic: mqtt_out.topic.unwrap_or_default(),
            username: mqtt_out.username,
            password: mqtt_out.password.map(Zeroizing::new),
            use_tls: mqtt_out.use_tls.unwrap_or(mqtt_port == MQTT_TLS_PORT),
            ca_path: mqtt_out.ca_path,
            client_cert_path: mqtt_out.client_cert_path,
            client_key_path: mqtt_out.client_key_path,
            client_id: mqtt_out
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            include_crops: mqtt_out.include_crops.unwrap_or(true),
        };

        let http_out = output.http.unwrap_or_default();
        let http = HttpOutputSettings {
            enabled: http_out.transmit_http.unwrap_or(false),
            url: http_out.url.unwrap_or_default(),
            method: http_out
                .method
                .unwrap_or_else(|| DEFAULT_HTTP_METHOD.to_string())
                .to_ascii_uppercase(),
            username: http_out.username,
            password: http_out.password.map(Zeroizing::new),
            timeout: Duration::from_millis(http_out.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)),
            include_crops: http_out.include_crops.unwrap_or(true),
        };

        Ok(Self {
            hostname,
            model,
            queue,
            file,
            mqtt,
            http,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("POLLINATOR_QUEUE_HOST") {
            if !host.trim().is_empty() {
                self.queue.host = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("POLLINATOR_QUEUE_PORT") {
            self.queue.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("POLLINATOR_QUEUE_PORT must be a port number"))?;
        }
        if let Ok(password) = std::env::var("POLLINATOR_MQTT_PASSWORD") {
            if !password.is_empty() {
                self.mqtt.password = Some(Zeroizing::new(password));
            }
        }
        if let Ok(password) = std::env::var("POLLINATOR_HTTP_PASSWORD") {
            if !password.is_empty() {
                self.http.password = Some(Zeroizing::new(password));
            }
        }
        if let Ok(hostname) = std::env::var("POLLINATOR_HOSTNAME") {
            if !hostname.trim().is_empty() {
                self.hostname = hostname.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        check_unit("model.confidence_threshold", self.model.confidence_threshold)?;
        check_unit("model.iou_threshold", self.model.iou_threshold)?;
        check_unit(
            "model.multi_label_iou_threshold",
            self.model.multi_label_iou_threshold,
        )?;
        if self.model.max_detections == 0 {
            return Err(anyhow!("model.max_detections must be greater than zero"));
        }
        if self.model.input_size == 0 || self.model.input_size % 32 != 0 {
            return Err(anyhow!(
                "model.input_size must be a positive multiple of 32, got {}",
                self.model.input_size
            ));
        }

        if self.queue.host.trim().is_empty() {
            return Err(anyhow!("queue.host must not be empty"));
        }
        if self.queue.request_retries == 0 {
            return Err(anyhow!("queue.request_retries must be at least 1"));
        }
        if self.queue.request_timeout.is_zero() {
            return Err(anyhow!("queue.request_timeout_ms must be greater than zero"));
        }

        if self.mqtt.enabled {
            if self.mqtt.host.trim().is_empty() {
                return Err(anyhow!("output.mqtt.host is required when transmit_mqtt is set"));
            }
            if self.mqtt.topic.trim().is_empty() {
                return Err(anyhow!("output.mqtt.topic is required when transmit_mqtt is set"));
            }
            Template::parse(&self.mqtt.topic).context("output.mqtt.topic")?;
            Template::parse(&self.mqtt.client_id).context("output.mqtt.client_id")?;
            if self.mqtt.client_cert_path.is_some() != self.mqtt.client_key_path.is_some() {
                return Err(anyhow!(
                    "output.mqtt.client_cert_path and client_key_path must be set together"
                ));
            }
        }

        if self.http.enabled {
            if self.http.url.trim().is_empty() {
                return Err(anyhow!("output.http.url is required when transmit_http is set"));
            }
            let template = Template::parse(&self.http.url).context("output.http.url")?;
            // Parse with sample values so placeholders do not trip the URL parser.
            let sample = template.render(&crate::sink::TemplateValues {
                hostname: &self.hostname,
                node_id: "node",
                filename: "node_1970-01-01T00-00-00Z.json",
            });
            url::Url::parse(&sample)
                .with_context(|| format!("output.http.url '{}' is not a valid URL", self.http.url))?;
            if !HTTP_METHODS.contains(&self.http.method.as_str()) {
                return Err(anyhow!(
                    "output.http.method '{}' is not supported (expected one of {})",
                    self.http.method,
                    HTTP_METHODS.join(", ")
                ));
            }
            if self.http.timeout.is_zero() {
                return Err(anyhow!("output.http.timeout_ms must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn queue_endpoint(&self) -> String {
        format!("{}:{}", self.queue.host, self.queue.port)
    }

    /// Any sink enabled at all.
    pub fn has_output(&self) -> bool {
        self.file.enabled || self.mqtt.enabled || self.http.enabled
    }
}

impl MqttOutputSettings {
    pub fn tls_materials(&self) -> Result<TlsMaterials> {
        TlsMaterials::load(
            self.ca_path.as_deref(),
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        )
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<WorkerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
