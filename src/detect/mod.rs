//! Pollinator detection on flower crops.
//!
//! A [`PollinatorModel`] takes one flower crop and returns the pollinators it
//! finds, numbered locally from zero. Offsetting those numbers into a
//! batch-wide index is the pipeline's job.

mod backend;
mod backends;
mod result;
pub mod yolo;

pub use backend::{build_model, ModelBackend, ModelSettings, PollinatorModel};
pub use backends::{ScriptedOutcome, StubModel};
pub use result::{InferenceMetadata, InferenceTimes, ModelDetection};

#[cfg(feature = "backend-tract")]
pub use backends::TractYoloModel;
