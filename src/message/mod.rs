//! Message codec: inbound detection batches, outbound result batches and the
//! archive naming used by the file sink.

mod build;
mod model;
mod parse;
mod path;

pub use build::{
    build_message, encode_crop, format_timestamp, round_score, OutboundFlower, OutboundMessage,
    OutboundPollinator,
};
pub use model::{
    CaptureMetadata, DetectionBatch, Flower, Pollinator, ResultBatch, SourceDetection,
};
pub use parse::{parse_batch, parse_batch_str, parse_timestamp, FieldProblem, ParseError};
pub use path::{archive_dir, archive_filename, archive_path};

/// Section holding the capture-side (flower) metadata.
pub const FLOWER_SECTION: &str = "flower_inference";
/// Section holding this worker's model metadata.
pub const POLLINATOR_SECTION: &str = "pollinator_inference";
