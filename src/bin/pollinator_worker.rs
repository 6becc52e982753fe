//! pollinator_worker - queue-driven pollinator detection
//!
//! This daemon:
//! 1. Pops flower batches from the queue server
//! 2. Runs the pollinator model on every flower crop
//! 3. Delivers the result to the enabled sinks (file, MQTT, HTTP)
//!
//! Exits nonzero when the configuration is invalid or the queue server stops
//! answering.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use pollinator_worker::{
    build_model, build_sinks, config::DEFAULT_CONFIG_PATH, Pipeline, QueueClient, TcpConnector,
    WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Detect pollinators in flower crops pulled from a queue server"
)]
struct Args {
    /// Configuration file (TOML, or JSON when the extension is .json).
    #[arg(long, env = "POLLINATOR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = WorkerConfig::load(&args.config)
        .with_context(|| format!("load configuration from {}", args.config.display()))?;
    log::info!(
        "pollinator_worker {} on {} (queue {})",
        env!("CARGO_PKG_VERSION"),
        cfg.hostname,
        cfg.queue_endpoint()
    );

    let model = build_model(&cfg.model)?;
    let sinks = build_sinks(&cfg)?;
    let queue = QueueClient::new(
        TcpConnector::new(cfg.queue.host.clone(), cfg.queue.port),
        cfg.queue.request_timeout,
        cfg.queue.request_retries,
    );
    let mut pipeline = Pipeline::new(queue, model, sinks, cfg.queue.idle_backoff);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    if let Err(e) = pipeline.run(&shutdown) {
        log::error!("{}", e);
        return Err(e.into());
    }
    log::info!("pollinator_worker stopped");
    Ok(())
}
