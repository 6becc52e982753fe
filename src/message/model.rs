use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use image::DynamicImage;
use serde::Serialize;

/// One dequeued unit of work: the flower crops a capture node produced for a
/// single capture event.
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub node_id: String,
    pub captured_at: DateTime<FixedOffset>,
    pub detections: Vec<SourceDetection>,
    pub metadata: CaptureMetadata,
}

impl DetectionBatch {
    pub fn num_detections(&self) -> usize {
        self.detections.len()
    }
}

/// A coarse flower detection supplied by the upstream producer.
#[derive(Clone, Debug)]
pub struct SourceDetection {
    pub class_name: String,
    pub score: f64,
    pub image: DynamicImage,
}

/// Capture-side metadata carried by an inbound batch. Every field is optional
/// on the wire; absent values are serialized as `null` in the result.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CaptureMetadata {
    pub confidence_threshold: Option<f64>,
    pub iou_threshold: Option<f64>,
    pub margin: Option<i64>,
    pub model_name: Option<String>,
    pub max_det: Option<u64>,
    pub original_image_size: Option<[u32; 2]>,
    pub capture_duration: Option<f64>,
    pub image_source: Option<String>,
}

/// Enriched source detection as it appears in the result batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Flower {
    pub index: u32,
    pub class_name: String,
    pub score: f64,
    pub width: u32,
    pub height: u32,
}

/// Sub-detection found by the model inside a flower crop.
#[derive(Clone, Debug)]
pub struct Pollinator {
    pub index: u32,
    pub flower_index: u32,
    pub class_name: String,
    pub score: f64,
    pub width: u32,
    pub height: u32,
    pub crop: DynamicImage,
}

/// Result of one pipeline pass, ready to be encoded and handed to the sinks.
#[derive(Clone, Debug)]
pub struct ResultBatch {
    pub node_id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub flowers: Vec<Flower>,
    pub pollinators: Vec<Pollinator>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResultBatch {
    pub fn new(node_id: impl Into<String>, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            flowers: Vec::new(),
            pollinators: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn add_flower(&mut self, flower: Flower) {
        self.flowers.push(flower);
    }

    pub fn add_pollinator(&mut self, pollinator: Pollinator) {
        self.pollinators.push(pollinator);
    }

    /// Store `metadata` under its own named section. A section written twice
    /// keeps the last value.
    pub fn add_metadata<T: Serialize>(&mut self, section: &str, metadata: &T) -> Result<()> {
        let value = serde_json::to_value(metadata)
            .with_context(|| format!("serialize metadata section '{}'", section))?;
        self.metadata.insert(section.to_string(), value);
        Ok(())
    }
}
