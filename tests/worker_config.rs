use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use pollinator_worker::detect::ModelBackend;
use pollinator_worker::{build_sinks, WorkerConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "POLLINATOR_CONFIG",
        "POLLINATOR_QUEUE_HOST",
        "POLLINATOR_QUEUE_PORT",
        "POLLINATOR_MQTT_PASSWORD",
        "POLLINATOR_HTTP_PASSWORD",
        "POLLINATOR_HOSTNAME",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
hostname = "ap-field-station"

[model]
backend = "stub"
confidence_threshold = 0.4
class_names = ["honeybee", "bumblebee", "hoverfly"]

[queue]
host = "queue.local"
port = 6000
request_timeout_ms = 1500
request_retries = 4

[output.file]
store_file = true
base_dir = "/var/lib/pollinators"
save_crops = false

[output.http]
transmit_http = true
url = "https://collector.example/${hostname}/${node_id}"
method = "put"
username = "uploader"
password = "from-file"
"#,
    );

    std::env::set_var("POLLINATOR_QUEUE_PORT", "6100");
    std::env::set_var("POLLINATOR_HTTP_PASSWORD", "from-env");
    std::env::set_var("POLLINATOR_HOSTNAME", "station-9");

    let cfg = WorkerConfig::load(file.path()).expect("load config");
    clear_env();

    assert_eq!(cfg.hostname, "station-9");
    assert_eq!(cfg.model.backend, ModelBackend::Stub);
    assert_eq!(cfg.model.confidence_threshold, 0.4);
    assert_eq!(cfg.model.class_names.len(), 3);
    assert_eq!(cfg.queue.host, "queue.local");
    assert_eq!(cfg.queue.port, 6100);
    assert_eq!(cfg.queue.request_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.queue.request_retries, 4);
    assert_eq!(cfg.queue_endpoint(), "queue.local:6100");
    assert!(cfg.file.enabled);
    assert!(!cfg.file.save_crops);
    assert!(!cfg.mqtt.enabled);
    assert!(cfg.http.enabled);
    assert_eq!(cfg.http.method, "PUT");
    assert_eq!(
        cfg.http.password.as_ref().map(|p| p.as_str()),
        Some("from-env")
    );
}

#[test]
fn json_config_is_picked_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "hostname": "bench",
            "model": {"backend": "stub", "max_detections": 25},
            "queue": {"port": 5999},
            "output": {"file": {"store_file": true, "base_dir": "results"}}
        }"#,
    );
    let cfg = WorkerConfig::load(file.path()).expect("load json config");

    assert_eq!(cfg.hostname, "bench");
    assert_eq!(cfg.model.max_detections, 25);
    assert_eq!(cfg.queue.port, 5999);
    assert_eq!(cfg.queue.host, "127.0.0.1");
    assert_eq!(cfg.file.base_dir, std::path::PathBuf::from("results"));
}

#[test]
fn missing_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().unwrap();
    let err = WorkerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn invalid_port_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".toml", "[model]\nbackend = \"stub\"\n");
    std::env::set_var("POLLINATOR_QUEUE_PORT", "not-a-port");
    let result = WorkerConfig::load(file.path());
    clear_env();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("POLLINATOR_QUEUE_PORT"));
}

#[test]
fn enabled_sinks_are_built_in_order() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let out = tempfile::tempdir().unwrap();
    let file = write_config(
        ".toml",
        &format!(
            r#"
hostname = "bench"

[model]
backend = "stub"

[output.file]
store_file = true
base_dir = "{}"

[output.http]
transmit_http = true
url = "http://127.0.0.1:9/ingest/${{node_id}}"
"#,
            out.path().display()
        ),
    );
    let cfg = WorkerConfig::load(file.path()).expect("load config");
    let sinks = build_sinks(&cfg).expect("build sinks");
    assert_eq!(sinks.names(), vec!["file", "http"]);
}
