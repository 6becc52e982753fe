//! YOLOv5 pre- and post-processing.
//!
//! Everything here is plain arithmetic over images and `f32` slices so it can
//! be tested without loading a network. The ONNX backend feeds the letterboxed
//! tensor to the model and hands the raw output back to [`detections_from_output`].

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use super::backend::ModelSettings;
use super::result::ModelDetection;

const PAD_VALUE: u8 = 114;
/// Box coordinates plus objectness precede the class scores in each row.
const BOX_ATTRS: usize = 5;

/// Network input plus the transform needed to map boxes back.
#[derive(Clone, Debug)]
pub struct Letterbox {
    /// NCHW, RGB, normalised to `0..=1`.
    pub tensor: Vec<f32>,
    pub size: u32,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// Resize `image` to fit a `size` x `size` square keeping its aspect ratio and
/// pad the remainder with gray.
pub fn letterbox(image: &DynamicImage, size: u32) -> Letterbox {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let plane = (size * size) as usize;
    let mut tensor = vec![0f32; 3 * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let offset = (y * size + x) as usize;
        for c in 0..3 {
            tensor[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }

    Letterbox {
        tensor,
        size,
        scale,
        pad_x: pad_x.floor(),
        pad_y: pad_y.floor(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: usize,
}

/// Decode a YOLOv5 output of `rows x (5 + classes)` values into candidates
/// above the confidence threshold. Boxes stay in letterbox coordinates.
pub fn decode(output: &[f32], attrs: usize, settings: &ModelSettings) -> Result<Vec<Candidate>> {
    if attrs <= BOX_ATTRS {
        return Err(anyhow!(
            "model output rows have {} values, expected more than {}",
            attrs,
            BOX_ATTRS
        ));
    }
    if output.len() % attrs != 0 {
        return Err(anyhow!(
            "model output length {} is not a multiple of row size {}",
            output.len(),
            attrs
        ));
    }

    let threshold = settings.confidence_threshold;
    let mut candidates = Vec::new();
    for row in output.chunks_exact(attrs) {
        let objectness = row[4];
        if objectness < threshold {
            continue;
        }
        let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
        let class_scores = row[BOX_ATTRS..].iter().map(|&s| s * objectness);
        if settings.multi_label {
            for (class_id, score) in class_scores.enumerate() {
                if score > threshold {
                    candidates.push(Candidate {
                        bbox,
                        score,
                        class_id,
                    });
                }
            }
        } else if let Some((class_id, score)) = class_scores
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        {
            if score > threshold {
                candidates.push(Candidate {
                    bbox,
                    score,
                    class_id,
                });
            }
        }
    }
    Ok(candidates)
}

/// Class-aware non-maximum suppression. Output is sorted by descending score.
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// Collapse boxes of different classes that cover the same object, keeping
/// the best scoring label. Expects input sorted by descending score.
pub fn merge_labels(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut keep: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !keep
            .iter()
            .any(|kept| kept.bbox.iou(&candidate.bbox) > iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

/// Map a box from letterbox space back onto the source image, clamped to it.
pub fn unletterbox(bbox: &BoundingBox, letterbox: &Letterbox, width: u32, height: u32) -> BoundingBox {
    let map_x = |x: f32| ((x - letterbox.pad_x) / letterbox.scale).clamp(0.0, width as f32);
    let map_y = |y: f32| ((y - letterbox.pad_y) / letterbox.scale).clamp(0.0, height as f32);
    BoundingBox {
        x1: map_x(bbox.x1),
        y1: map_y(bbox.y1),
        x2: map_x(bbox.x2),
        y2: map_y(bbox.y2),
    }
}

/// Crop `bbox` grown by `margin` pixels on every side, clamped to the image.
/// `None` when nothing is left.
pub fn crop_with_margin(image: &DynamicImage, bbox: &BoundingBox, margin: u32) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let margin = margin as f32;
    let x1 = (bbox.x1.floor() - margin).max(0.0) as u32;
    let y1 = (bbox.y1.floor() - margin).max(0.0) as u32;
    let x2 = ((bbox.x2.ceil() + margin).max(0.0) as u32).min(width);
    let y2 = ((bbox.y2.ceil() + margin).max(0.0) as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image.crop_imm(x1, y1, x2 - x1, y2 - y1))
}

/// Full post-processing: decode, suppress, cap, crop.
///
/// Local indices follow the post-suppression order. A box whose crop ends up
/// empty is skipped and its index is not reused.
pub fn detections_from_output(
    image: &DynamicImage,
    output: &[f32],
    attrs: usize,
    letterbox: &Letterbox,
    settings: &ModelSettings,
) -> Result<Vec<ModelDetection>> {
    let mut kept = nms(decode(output, attrs, settings)?, settings.iou_threshold);
    if settings.multi_label {
        kept = merge_labels(kept, settings.multi_label_iou_threshold);
    }
    kept.truncate(settings.max_detections);

    let (width, height) = image.dimensions();
    let mut detections = Vec::with_capacity(kept.len());
    for (index, candidate) in kept.iter().enumerate() {
        let bbox = unletterbox(&candidate.bbox, letterbox, width, height);
        let Some(crop) = crop_with_margin(image, &bbox, settings.margin) else {
            log::debug!("skipping detection {} with empty crop", index);
            continue;
        };
        detections.push(ModelDetection {
            index: index as u32,
            class_name: settings.class_name(candidate.class_id),
            score: candidate.score as f64,
            crop,
        });
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ModelSettings {
        ModelSettings {
            class_names: vec!["honeybee".into(), "bumblebee".into()],
            margin: 0,
            ..ModelSettings::default()
        }
    }

    fn row(cx: f32, cy: f32, w: f32, h: f32, obj: f32, classes: [f32; 2]) -> Vec<f32> {
        vec![cx, cy, w, h, obj, classes[0], classes[1]]
    }

    #[test]
    fn letterbox_pads_short_side() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
        let lb = letterbox(&image, 64);
        assert_eq!(lb.tensor.len(), 3 * 64 * 64);
        assert!((lb.scale - 0.32).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 16.0);

        let plane = 64 * 64;
        // top-left is padding, centre is image
        assert!((lb.tensor[0] - 114.0 / 255.0).abs() < 1e-6);
        let centre = 32 * 64 + 32;
        assert!((lb.tensor[centre] - 1.0).abs() < 1e-6);
        assert!(lb.tensor[plane + centre].abs() < 1e-6);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::from_center(10.0, 10.0, 10.0, 10.0);
        let b = BoundingBox::from_center(40.0, 40.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn decode_applies_objectness_and_threshold() {
        let mut output = row(10.0, 10.0, 4.0, 4.0, 0.9, [0.9, 0.1]);
        output.extend(row(30.0, 30.0, 4.0, 4.0, 0.1, [1.0, 1.0]));
        output.extend(row(50.0, 50.0, 4.0, 4.0, 0.5, [0.2, 0.3]));
        let candidates = decode(&output, 7, &settings()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 0);
        assert!((candidates[0].score - 0.81).abs() < 1e-6);
    }

    #[test]
    fn decode_rejects_ragged_output() {
        assert!(decode(&[0.0; 10], 7, &settings()).is_err());
        assert!(decode(&[0.0; 10], 5, &settings()).is_err());
    }

    #[test]
    fn multi_label_emits_every_class_over_threshold() {
        let output = row(10.0, 10.0, 4.0, 4.0, 1.0, [0.8, 0.6]);
        let mut s = settings();
        s.multi_label = true;
        assert_eq!(decode(&output, 7, &s).unwrap().len(), 2);

        let merged = merge_labels(nms(decode(&output, 7, &s).unwrap(), s.iou_threshold), 0.5);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].class_id, 0);
    }

    #[test]
    fn nms_is_class_aware() {
        let bbox = BoundingBox::from_center(10.0, 10.0, 10.0, 10.0);
        let shifted = BoundingBox::from_center(11.0, 10.0, 10.0, 10.0);
        let candidates = vec![
            Candidate { bbox, score: 0.6, class_id: 0 },
            Candidate { bbox: shifted, score: 0.9, class_id: 0 },
            Candidate { bbox, score: 0.5, class_id: 1 },
        ];
        let kept = nms(candidates, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(50, 40));
        let bbox = BoundingBox { x1: 5.0, y1: 5.0, x2: 20.0, y2: 15.0 };
        let crop = crop_with_margin(&image, &bbox, 10).unwrap();
        assert_eq!(crop.dimensions(), (30, 25));

        let outside = BoundingBox { x1: 50.0, y1: 10.0, x2: 50.0, y2: 20.0 };
        assert!(crop_with_margin(&image, &outside, 0).is_none());
    }

    #[test]
    fn end_to_end_postprocessing_maps_back_to_source() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(128, 64));
        let lb = letterbox(&image, 64);
        // letterbox: scale 0.5, pad_y 16
        let mut output = row(16.0, 32.0, 8.0, 8.0, 0.9, [0.1, 0.9]);
        output.extend(row(48.0, 32.0, 8.0, 8.0, 0.95, [0.9, 0.1]));
        let mut s = settings();
        s.max_detections = 5;

        let detections = detections_from_output(&image, &output, 7, &lb, &s).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].index, 0);
        assert_eq!(detections[0].class_name, "honeybee");
        assert_eq!(detections[1].class_name, "bumblebee");
        assert_eq!(detections[0].crop.dimensions(), (16, 16));
    }

    #[test]
    fn max_detections_caps_output() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let lb = letterbox(&image, 64);
        let mut output = Vec::new();
        for i in 0..5 {
            output.extend(row(6.0 + i as f32 * 12.0, 10.0, 4.0, 4.0, 0.9, [0.9, 0.0]));
        }
        let mut s = settings();
        s.max_detections = 3;
        assert_eq!(detections_from_output(&image, &output, 7, &lb, &s).unwrap().len(), 3);
    }
}
