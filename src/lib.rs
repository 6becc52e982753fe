//! Pollinator detection worker.
//!
//! Capture nodes detect flowers and push the flower crops to a queue server.
//! This crate pulls those batches one at a time, runs a pollinator detector
//! over every crop and delivers the enriched result to any combination of a
//! local file archive, an MQTT broker and an HTTP endpoint.
//!
//! # Module Structure
//!
//! - `message`: inbound batch parsing, outbound result encoding, archive paths
//! - `queue`: request/reply client for the queue server (ZMTP over TCP)
//! - `detect`: pollinator model adapter (ONNX via tract, or a stub)
//! - `pipeline`: the worker loop and pollinator index allocation
//! - `sink`: file, MQTT and HTTP result delivery
//! - `config`: file plus environment configuration

pub mod config;
pub mod detect;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod sink;

pub use config::WorkerConfig;
pub use detect::{build_model, ModelDetection, ModelSettings, PollinatorModel};
pub use message::{
    build_message, parse_batch, parse_batch_str, DetectionBatch, OutboundMessage, ParseError,
    ResultBatch,
};
pub use pipeline::{process_batch, IndexAllocator, Iteration, Pipeline};
pub use queue::{Opcode, QueueClient, QueueError, QueueStatus, Reply, TcpConnector};
pub use sink::{build_sinks, ResultSink, SinkFanout};
