use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::DynamicImage;

use super::result::{InferenceMetadata, ModelDetection};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MARGIN: u32 = 40;
pub const DEFAULT_MULTI_LABEL_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_DETECTIONS: usize = 10;
pub const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_WEIGHTS_PATH: &str = "weights/pollinators.onnx";

/// Detection model adapter.
///
/// Implementations keep per-call inference timings so the pipeline can report
/// them in the `pollinator_inference` metadata section. Timings are cleared
/// once per batch through [`PollinatorModel::reset_inference_times`].
pub trait PollinatorModel: Send {
    /// Model identifier reported in metadata.
    fn name(&self) -> &str;

    /// Find pollinators in one flower crop. Indices in the result are local to
    /// this call, start at zero and may have gaps.
    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<ModelDetection>>;

    /// Model parameters plus accumulated inference timings.
    fn metadata(&self) -> InferenceMetadata;

    fn reset_inference_times(&mut self);
}

/// Which [`PollinatorModel`] implementation to construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelBackend {
    Tract,
    Stub,
}

impl FromStr for ModelBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tract" | "onnx" => Ok(Self::Tract),
            "stub" => Ok(Self::Stub),
            other => Err(anyhow!(
                "unknown model backend '{}' (expected 'tract' or 'stub')",
                other
            )),
        }
    }
}

impl fmt::Display for ModelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tract => "tract",
            Self::Stub => "stub",
        })
    }
}

/// Model parameters, fixed at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSettings {
    pub backend: ModelBackend,
    pub weights_path: PathBuf,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Pixels added around each detected box before cropping.
    pub margin: u32,
    pub multi_label: bool,
    pub multi_label_iou_threshold: f32,
    pub max_detections: usize,
    pub class_names: Vec<String>,
    pub augment: bool,
    /// Side of the square network input.
    pub input_size: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backend: ModelBackend::Tract,
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_PATH),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            margin: DEFAULT_MARGIN,
            multi_label: false,
            multi_label_iou_threshold: DEFAULT_MULTI_LABEL_IOU_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            class_names: Vec::new(),
            augment: false,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl ModelSettings {
    /// Display name for class `class_id`.
    pub fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    /// Model name derived from the weights file stem.
    pub fn model_name(&self) -> String {
        self.weights_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.backend.to_string())
    }
}

/// Construct the configured model.
pub fn build_model(settings: &ModelSettings) -> Result<Box<dyn PollinatorModel>> {
    match settings.backend {
        ModelBackend::Stub => {
            log::warn!("using stub pollinator model, no inference will run");
            Ok(Box::new(super::StubModel::new(settings.clone())))
        }
        #[cfg(feature = "backend-tract")]
        ModelBackend::Tract => Ok(Box::new(super::TractYoloModel::load(settings.clone())?)),
        #[cfg(not(feature = "backend-tract"))]
        ModelBackend::Tract => Err(anyhow!(
            "model backend 'tract' requires building with the 'backend-tract' feature"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("tract".parse::<ModelBackend>().unwrap(), ModelBackend::Tract);
        assert_eq!(" Stub ".parse::<ModelBackend>().unwrap(), ModelBackend::Stub);
        assert!("torch".parse::<ModelBackend>().is_err());
    }

    #[test]
    fn class_names_fall_back_to_numeric_labels() {
        let settings = ModelSettings {
            class_names: vec!["honeybee".into(), "hoverfly".into()],
            ..ModelSettings::default()
        };
        assert_eq!(settings.class_name(1), "hoverfly");
        assert_eq!(settings.class_name(4), "class_4");
    }

    #[test]
    fn model_name_is_weights_stem() {
        assert_eq!(ModelSettings::default().model_name(), "pollinators");
    }

    #[test]
    fn builds_stub_model() {
        let settings = ModelSettings {
            backend: ModelBackend::Stub,
            ..ModelSettings::default()
        };
        let model = build_model(&settings).unwrap();
        assert_eq!(model.name(), "stub");
    }
}
