use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};

use crate::detect::backend::{ModelSettings, PollinatorModel};
use crate::detect::result::{InferenceMetadata, InferenceTimes, ModelDetection};

/// What the stub returns for one `predict` call.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    /// Detections with these local indices and class names. Each crop is the
    /// top-left quarter of the input.
    Detect(Vec<(u32, String)>),
    Fail(String),
}

/// Model without a network, for tests and dry runs.
///
/// Outcomes are consumed in call order; once the script is exhausted every
/// call returns no detections.
pub struct StubModel {
    settings: ModelSettings,
    script: VecDeque<ScriptedOutcome>,
    times: InferenceTimes,
}

impl StubModel {
    pub fn new(settings: ModelSettings) -> Self {
        Self::scripted(settings, Vec::new())
    }

    pub fn scripted(settings: ModelSettings, script: Vec<ScriptedOutcome>) -> Self {
        Self {
            settings,
            script: script.into(),
            times: InferenceTimes::default(),
        }
    }

    /// Shorthand: one call per entry, each yielding the given local indices.
    pub fn with_indices(settings: ModelSettings, calls: &[&[u32]]) -> Self {
        let script = calls
            .iter()
            .map(|indices| {
                ScriptedOutcome::Detect(
                    indices
                        .iter()
                        .map(|&i| (i, settings.class_name(0)))
                        .collect(),
                )
            })
            .collect();
        Self::scripted(settings, script)
    }
}

impl PollinatorModel for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<ModelDetection>> {
        let started = Instant::now();
        let outcome = self.script.pop_front();
        self.times.record(started.elapsed());

        match outcome {
            None => Ok(Vec::new()),
            Some(ScriptedOutcome::Fail(reason)) => Err(anyhow!(reason)),
            Some(ScriptedOutcome::Detect(entries)) => {
                let (width, height) = image.dimensions();
                let crop = image.crop_imm(0, 0, (width / 2).max(1), (height / 2).max(1));
                Ok(entries
                    .into_iter()
                    .map(|(index, class_name)| ModelDetection {
                        index,
                        class_name,
                        score: 0.5,
                        crop: crop.clone(),
                    })
                    .collect())
            }
        }
    }

    fn metadata(&self) -> InferenceMetadata {
        InferenceMetadata::new(self.name(), &self.settings, &self.times)
    }

    fn reset_inference_times(&mut self) {
        self.times.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn replays_script_then_goes_quiet() {
        let mut model = StubModel::scripted(
            ModelSettings::default(),
            vec![
                ScriptedOutcome::Detect(vec![(0, "honeybee".into()), (2, "hoverfly".into())]),
                ScriptedOutcome::Fail("boom".into()),
            ],
        );
        let image = DynamicImage::ImageRgb8(RgbImage::new(20, 10));

        let first = model.predict(&image).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].index, 2);
        assert_eq!(first[1].crop.dimensions(), (10, 5));
        assert!(model.predict(&image).is_err());
        assert!(model.predict(&image).unwrap().is_empty());

        assert_eq!(model.metadata().inference_times.count, 3);
        model.reset_inference_times();
        assert_eq!(model.metadata().inference_times.count, 0);
    }
}
