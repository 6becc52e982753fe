//! Inbound detection-batch decoding.
//!
//! Parsing walks the whole payload and records every problem it meets before
//! deciding. A batch is only returned when the payload is clean; otherwise the
//! caller receives one [`ParseError`] listing all problems.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::model::{CaptureMetadata, DetectionBatch, SourceDetection};

/// A single defect found in an inbound payload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldProblem {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing required field '{0}'")]
    Missing(String),
    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("field '{field}' value {value} is outside [0, 1]")]
    OutOfRange { field: String, value: f64 },
    #[error("field '{field}' is not an ISO-8601 timestamp: '{value}'")]
    InvalidTimestamp { field: String, value: String },
    #[error("field '{field}' is not a decodable image: {reason}")]
    InvalidCrop { field: String, reason: String },
    #[error("declared {declared} detections but payload carries {actual}")]
    CountMismatch { declared: u64, actual: usize },
}

/// Aggregated parse failure. Never accompanied by a partial batch.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed detection batch: {}", join_problems(.problems))]
pub struct ParseError {
    pub problems: Vec<FieldProblem>,
}

fn join_problems(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse JSON text into a batch.
pub fn parse_batch_str(raw: &str) -> Result<DetectionBatch, ParseError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => parse_batch(&value),
        Err(e) => Err(ParseError {
            problems: vec![FieldProblem::InvalidJson(e.to_string())],
        }),
    }
}

/// Parse a JSON value into a batch. A JSON string is treated as JSON text and
/// decoded once more; a string nested inside that is rejected.
pub fn parse_batch(raw: &Value) -> Result<DetectionBatch, ParseError> {
    match raw {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(inner) => parse_object(&inner),
            Err(e) => Err(ParseError {
                problems: vec![FieldProblem::InvalidJson(e.to_string())],
            }),
        },
        other => parse_object(other),
    }
}

fn parse_object(raw: &Value) -> Result<DetectionBatch, ParseError> {
    let mut problems = Vec::new();
    let Some(root) = raw.as_object() else {
        return Err(ParseError {
            problems: vec![FieldProblem::WrongType {
                field: "$".to_string(),
                expected: "an object",
            }],
        });
    };

    let meta = object_field(root, "metadata", "metadata", &mut problems);
    let node_id = meta.and_then(|m| {
        string_field(m, "node_id", "metadata.node_id", true, &mut problems).and_then(|id| {
            if id.is_empty() {
                problems.push(FieldProblem::WrongType {
                    field: "metadata.node_id".to_string(),
                    expected: "a non-empty string",
                });
                None
            } else {
                Some(id)
            }
        })
    });
    let captured_at = meta.and_then(|m| {
        string_field(
            m,
            "capture_timestamp",
            "metadata.capture_timestamp",
            true,
            &mut problems,
        )
        .and_then(|ts| match parse_timestamp(&ts) {
            Some(parsed) => Some(parsed),
            None => {
                problems.push(FieldProblem::InvalidTimestamp {
                    field: "metadata.capture_timestamp".to_string(),
                    value: ts,
                });
                None
            }
        })
    });
    let declared = meta.and_then(|m| {
        optional(m, "num_detections").and_then(|v| match v.as_u64() {
            Some(n) => Some(n),
            None => {
                problems.push(FieldProblem::WrongType {
                    field: "metadata.num_detections".to_string(),
                    expected: "a non-negative integer",
                });
                None
            }
        })
    });
    let capture_meta = meta
        .map(|m| capture_metadata(m, &mut problems))
        .unwrap_or_default();

    let detections = object_field(root, "detections", "detections", &mut problems);
    let flowers = detections.and_then(|d| match d.get("flowers") {
        None | Some(Value::Null) => {
            problems.push(FieldProblem::Missing("detections.flowers".to_string()));
            None
        }
        Some(Value::Array(items)) => Some(items),
        Some(_) => {
            problems.push(FieldProblem::WrongType {
                field: "detections.flowers".to_string(),
                expected: "an array",
            });
            None
        }
    });

    let mut parsed = Vec::new();
    if let Some(items) = flowers {
        for (i, item) in items.iter().enumerate() {
            if let Some(det) = source_detection(i, item, &mut problems) {
                parsed.push(det);
            }
        }
        if let Some(declared) = declared {
            if declared != items.len() as u64 {
                problems.push(FieldProblem::CountMismatch {
                    declared,
                    actual: items.len(),
                });
            }
        }
    }

    match (node_id, captured_at) {
        (Some(node_id), Some(captured_at)) if problems.is_empty() => Ok(DetectionBatch {
            node_id,
            captured_at,
            detections: parsed,
            metadata: capture_meta,
        }),
        _ => Err(ParseError { problems }),
    }
}

/// Accepts RFC 3339, the space-separated ISO form and offset-less ISO forms
/// (read as UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    None
}

fn source_detection(
    index: usize,
    item: &Value,
    problems: &mut Vec<FieldProblem>,
) -> Option<SourceDetection> {
    let prefix = format!("detections.flowers[{}]", index);
    let Some(obj) = item.as_object() else {
        problems.push(FieldProblem::WrongType {
            field: prefix,
            expected: "an object",
        });
        return None;
    };

    let class_name = string_field(
        obj,
        "class_name",
        &format!("{}.class_name", prefix),
        true,
        problems,
    );
    let score = number_field(obj, "score", &format!("{}.score", prefix), true, problems)
        .and_then(|score| {
            if (0.0..=1.0).contains(&score) {
                Some(score)
            } else {
                problems.push(FieldProblem::OutOfRange {
                    field: format!("{}.score", prefix),
                    value: score,
                });
                None
            }
        });
    let crop_field = format!("{}.crop", prefix);
    let image = string_field(obj, "crop", &crop_field, true, problems).and_then(|encoded| {
        match decode_crop(&encoded) {
            Ok(image) => Some(image),
            Err(reason) => {
                problems.push(FieldProblem::InvalidCrop {
                    field: crop_field.clone(),
                    reason,
                });
                None
            }
        }
    });

    Some(SourceDetection {
        class_name: class_name?,
        score: score?,
        image: image?,
    })
}

fn decode_crop(encoded: &str) -> Result<image::DynamicImage, String> {
    let bytes = B64
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    image::load_from_memory(&bytes).map_err(|e| format!("invalid image data: {}", e))
}

fn capture_metadata(meta: &Map<String, Value>, problems: &mut Vec<FieldProblem>) -> CaptureMetadata {
    let mut out = CaptureMetadata::default();

    if let Some(original) = optional_object(meta, "original_image", "metadata.original_image", problems)
    {
        out.original_image_size = optional(original, "size").and_then(|size| {
            let pair = size.as_array().and_then(|items| match items.as_slice() {
                [w, h] => Some([w.as_u64()? as u32, h.as_u64()? as u32]),
                _ => None,
            });
            if pair.is_none() {
                problems.push(FieldProblem::WrongType {
                    field: "metadata.original_image.size".to_string(),
                    expected: "a [width, height] pair",
                });
            }
            pair
        });
        out.capture_duration = number_field(
            original,
            "capture_duration",
            "metadata.original_image.capture_duration",
            false,
            problems,
        );
        out.image_source = string_field(
            original,
            "source",
            "metadata.original_image.source",
            false,
            problems,
        );
    }

    if let Some(inference) =
        optional_object(meta, "flower_inference", "metadata.flower_inference", problems)
    {
        out.confidence_threshold = number_field(
            inference,
            "confidence_threshold",
            "metadata.flower_inference.confidence_threshold",
            false,
            problems,
        );
        out.iou_threshold = number_field(
            inference,
            "iou_threshold",
            "metadata.flower_inference.iou_threshold",
            false,
            problems,
        );
        out.margin = optional(inference, "margin").and_then(|v| {
            let margin = v.as_i64();
            if margin.is_none() {
                problems.push(FieldProblem::WrongType {
                    field: "metadata.flower_inference.margin".to_string(),
                    expected: "an integer",
                });
            }
            margin
        });
        out.model_name = string_field(
            inference,
            "model_name",
            "metadata.flower_inference.model_name",
            false,
            problems,
        );
        out.max_det = optional(inference, "max_det").and_then(|v| {
            let max_det = v.as_u64();
            if max_det.is_none() {
                problems.push(FieldProblem::WrongType {
                    field: "metadata.flower_inference.max_det".to_string(),
                    expected: "a non-negative integer",
                });
            }
            max_det
        });
    }

    out
}

/// Present and non-null.
fn optional<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn object_field<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<&'a Map<String, Value>> {
    match optional(obj, key) {
        None => {
            problems.push(FieldProblem::Missing(path.to_string()));
            None
        }
        Some(v) => {
            let map = v.as_object();
            if map.is_none() {
                problems.push(FieldProblem::WrongType {
                    field: path.to_string(),
                    expected: "an object",
                });
            }
            map
        }
    }
}

fn optional_object<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<&'a Map<String, Value>> {
    let value = optional(obj, key)?;
    let map = value.as_object();
    if map.is_none() {
        problems.push(FieldProblem::WrongType {
            field: path.to_string(),
            expected: "an object",
        });
    }
    map
}

fn string_field(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    required: bool,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    match optional(obj, key) {
        None => {
            if required {
                problems.push(FieldProblem::Missing(path.to_string()));
            }
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            problems.push(FieldProblem::WrongType {
                field: path.to_string(),
                expected: "a string",
            });
            None
        }
    }
}

fn number_field(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    required: bool,
    problems: &mut Vec<FieldProblem>,
) -> Option<f64> {
    match optional(obj, key) {
        None => {
            if required {
                problems.push(FieldProblem::Missing(path.to_string()));
            }
            None
        }
        Some(v) => {
            let number = v.as_f64();
            if number.is_none() {
                problems.push(FieldProblem::WrongType {
                    field: path.to_string(),
                    expected: "a number",
                });
            }
            number
        }
    }
}
