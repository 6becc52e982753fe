#![cfg(feature = "backend-tract")]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{ModelSettings, PollinatorModel};
use crate::detect::result::{InferenceMetadata, InferenceTimes, ModelDetection};
use crate::detect::yolo;

/// YOLOv5 pollinator detector running an exported ONNX graph through tract.
///
/// The graph must take a single `[1, 3, S, S]` f32 input and produce
/// `[1, rows, 5 + classes]`.
pub struct TractYoloModel {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    settings: ModelSettings,
    times: InferenceTimes,
}

impl TractYoloModel {
    pub fn load(settings: ModelSettings) -> Result<Self> {
        let size = settings.input_size as usize;
        let path = &settings.weights_path;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        if settings.augment {
            log::warn!("augment is not supported for ONNX weights, running without it");
        }
        log::info!(
            "loaded pollinator model {} ({}x{} input, {} classes configured)",
            path.display(),
            size,
            size,
            settings.class_names.len()
        );

        Ok(Self {
            model,
            settings,
            times: InferenceTimes::default(),
        })
    }

    fn run(&self, letterbox: &yolo::Letterbox) -> Result<(Vec<f32>, usize)> {
        let size = letterbox.size as usize;
        let input = tract_ndarray::Array4::from_shape_vec((1, 3, size, size), letterbox.tensor.clone())
            .context("letterbox tensor has wrong shape")?
            .into_tensor();
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 {
            return Err(anyhow!("expected 3D model output, got {:?}", shape));
        }
        let attrs = shape[2];
        Ok((view.iter().copied().collect(), attrs))
    }
}

impl PollinatorModel for TractYoloModel {
    fn name(&self) -> &str {
        "tract"
    }

    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<ModelDetection>> {
        let started = Instant::now();
        let letterbox = yolo::letterbox(image, self.settings.input_size);
        let (output, attrs) = self.run(&letterbox)?;
        self.times.record(started.elapsed());
        yolo::detections_from_output(image, &output, attrs, &letterbox, &self.settings)
    }

    fn metadata(&self) -> InferenceMetadata {
        InferenceMetadata::new(self.name(), &self.settings, &self.times)
    }

    fn reset_inference_times(&mut self) {
        self.times.reset();
    }
}
