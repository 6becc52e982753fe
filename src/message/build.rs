//! Outbound result encoding.

use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;

use super::model::ResultBatch;
use super::path::{archive_dir, archive_filename};

const SCORE_DECIMALS: i32 = 3;

/// Outbound timestamp text: `2024-03-05 14:22:00+00:00`, with microseconds
/// only when they are non-zero. Archive consumers parse this form.
pub fn format_timestamp(timestamp: &chrono::DateTime<chrono::FixedOffset>) -> String {
    use chrono::Timelike;
    if timestamp.nanosecond() / 1_000 == 0 {
        timestamp.format("%Y-%m-%d %H:%M:%S%:z").to_string()
    } else {
        timestamp.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
    }
}

/// Round a score to the fixed output precision.
pub fn round_score(score: f64) -> f64 {
    let factor = 10f64.powi(SCORE_DECIMALS);
    (score * factor).round() / factor
}

/// Encoded result batch shared by every sink. Lists are sorted by index and
/// crops are already JPEG/base64 encoded.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub node_id: String,
    pub timestamp: chrono::DateTime<chrono::FixedOffset>,
    pub flowers: Vec<OutboundFlower>,
    pub pollinators: Vec<OutboundPollinator>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundFlower {
    pub index: u32,
    pub class_name: String,
    pub score: f64,
    pub size: [u32; 2],
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundPollinator {
    pub index: u32,
    pub flower_index: u32,
    pub class_name: String,
    pub score: f64,
    pub size: [u32; 2],
    pub crop: String,
}

#[derive(Serialize)]
struct MessageView<'a> {
    node_id: &'a str,
    timestamp: String,
    detections: DetectionsView<'a>,
    metadata: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct DetectionsView<'a> {
    flowers: &'a [OutboundFlower],
    pollinators: Vec<PollinatorView<'a>>,
}

#[derive(Serialize)]
struct PollinatorView<'a> {
    index: u32,
    flower_index: u32,
    class_name: &'a str,
    score: f64,
    size: [u32; 2],
    crop: Option<&'a str>,
}

impl ResultBatch {
    /// Encode crops and sort both lists. Consumes the batch; crops are dropped
    /// once encoded.
    pub fn into_message(self) -> Result<OutboundMessage> {
        let mut flowers: Vec<OutboundFlower> = self
            .flowers
            .into_iter()
            .map(|f| OutboundFlower {
                index: f.index,
                class_name: f.class_name,
                score: round_score(f.score),
                size: [f.width, f.height],
            })
            .collect();
        flowers.sort_by_key(|f| f.index);

        let mut pollinators = Vec::with_capacity(self.pollinators.len());
        for p in self.pollinators {
            let crop = encode_crop(&p.crop)
                .with_context(|| format!("encode crop of pollinator {}", p.index))?;
            pollinators.push(OutboundPollinator {
                index: p.index,
                flower_index: p.flower_index,
                class_name: p.class_name,
                score: round_score(p.score),
                size: [p.width, p.height],
                crop,
            });
        }
        pollinators.sort_by_key(|p| p.index);

        Ok(OutboundMessage {
            node_id: self.node_id,
            timestamp: self.timestamp,
            flowers,
            pollinators,
            metadata: self.metadata,
        })
    }
}

impl OutboundMessage {
    /// JSON value of the message. Without crops every pollinator carries
    /// `"crop": null`.
    pub fn to_value(&self, include_crops: bool) -> Result<serde_json::Value> {
        serde_json::to_value(self.view(include_crops)).context("serialize result message")
    }

    /// Serialized JSON bytes of the message.
    pub fn render(&self, include_crops: bool) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.view(include_crops)).context("serialize result message")
    }

    pub fn filename(&self) -> String {
        archive_filename(&self.node_id, &self.timestamp)
    }

    pub fn relative_dir(&self) -> String {
        archive_dir(&self.node_id, &self.timestamp)
    }

    fn view(&self, include_crops: bool) -> MessageView<'_> {
        MessageView {
            node_id: &self.node_id,
            timestamp: format_timestamp(&self.timestamp),
            detections: DetectionsView {
                flowers: &self.flowers,
                pollinators: self
                    .pollinators
                    .iter()
                    .map(|p| PollinatorView {
                        index: p.index,
                        flower_index: p.flower_index,
                        class_name: &p.class_name,
                        score: p.score,
                        size: p.size,
                        crop: include_crops.then_some(p.crop.as_str()),
                    })
                    .collect(),
            },
            metadata: &self.metadata,
        }
    }
}

/// Encode and serialize a result batch in one step.
pub fn build_message(batch: ResultBatch, include_crops: bool) -> Result<serde_json::Value> {
    batch.into_message()?.to_value(include_crops)
}

/// JPEG-encode a crop and return it as standard base64.
pub fn encode_crop(crop: &DynamicImage) -> Result<String> {
    let rgb = match crop {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => crop.clone(),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, ImageFormat::Jpeg)
        .context("jpeg encode crop")?;
    Ok(B64.encode(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::model::{Flower, Pollinator};
    use chrono::DateTime;
    use image::{Rgb, RgbImage};
    use serde_json::json;

    fn crop(shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([shade, 90, 30])))
    }

    fn batch_with(flower_order: &[u32], pollinator_order: &[u32]) -> ResultBatch {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:22:00Z").unwrap();
        let mut batch = ResultBatch::new("n1", ts);
        for &i in flower_order {
            batch.add_flower(Flower {
                index: i,
                class_name: format!("flower_{i}"),
                score: 0.5 + i as f64 / 100.0,
                width: 10 + i,
                height: 20 + i,
            });
        }
        for &i in pollinator_order {
            batch.add_pollinator(Pollinator {
                index: i,
                flower_index: i / 2,
                class_name: "honeybee".to_string(),
                score: 0.812345,
                width: 8,
                height: 6,
                crop: crop(i as u8 * 20),
            });
        }
        batch
            .add_metadata("flower_inference", &json!({"model_name": "f"}))
            .unwrap();
        batch
    }

    #[test]
    fn lists_are_sorted_regardless_of_insertion_order() {
        let shuffled = build_message(batch_with(&[2, 0, 1], &[3, 1, 0, 2]), true).unwrap();
        let sorted = build_message(batch_with(&[0, 1, 2], &[0, 1, 2, 3]), true).unwrap();
        assert_eq!(shuffled, sorted);

        let indices: Vec<u64> = shuffled["detections"]["pollinators"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn scores_are_rounded_to_three_decimals() {
        let value = build_message(batch_with(&[0], &[0]), true).unwrap();
        assert_eq!(value["detections"]["pollinators"][0]["score"], json!(0.812));
        let text = value.to_string();
        assert!(!text.contains("0.812345"));
    }

    #[test]
    fn rounding_is_idempotent() {
        for x in [0.0, 0.1234, 0.9995, 0.33333333, 1.0, 0.0005, 0.812345] {
            let once = round_score(x);
            assert_eq!(round_score(once), once);
            let rendered = serde_json::to_string(&once).unwrap();
            let decimals = rendered.split('.').nth(1).map(|d| d.len()).unwrap_or(0);
            assert!(decimals <= 3, "{rendered}");
        }
    }

    #[test]
    fn crops_can_be_omitted() {
        let message = batch_with(&[0], &[0, 1]).into_message().unwrap();
        let with = message.to_value(true).unwrap();
        let without = message.to_value(false).unwrap();
        assert!(with["detections"]["pollinators"][0]["crop"].is_string());
        assert!(without["detections"]["pollinators"][0]["crop"].is_null());
        assert!(without["detections"]["pollinators"][1]
            .as_object()
            .unwrap()
            .contains_key("crop"));
    }

    #[test]
    fn encoded_crop_decodes_back_to_same_size() {
        let encoded = encode_crop(&crop(10)).unwrap();
        let bytes = B64.decode(encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn empty_batch_keeps_metadata_and_identity() {
        let value = build_message(batch_with(&[], &[]), true).unwrap();
        assert_eq!(value["node_id"], json!("n1"));
        assert_eq!(value["timestamp"], json!("2024-03-05 14:22:00+00:00"));
        assert_eq!(value["detections"]["flowers"], json!([]));
        assert_eq!(value["detections"]["pollinators"], json!([]));
        assert_eq!(value["metadata"]["flower_inference"]["model_name"], json!("f"));
    }

    #[test]
    fn timestamp_keeps_offset_and_drops_zero_fraction() {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:22:00+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-05 14:22:00+02:00");
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:22:00.25-05:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-05 14:22:00.250000-05:00");
        let reparsed = crate::message::parse_timestamp(&format_timestamp(&ts)).unwrap();
        assert_eq!(reparsed, ts);
    }

    #[test]
    fn flower_size_is_width_height_pair() {
        let value = build_message(batch_with(&[3], &[]), false).unwrap();
        assert_eq!(value["detections"]["flowers"][0]["size"], json!([13, 23]));
    }
}
