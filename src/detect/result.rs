use std::time::Duration;

use image::DynamicImage;
use serde::Serialize;

/// One pollinator found in a flower crop.
#[derive(Clone, Debug)]
pub struct ModelDetection {
    /// Index local to the `predict` call.
    pub index: u32,
    pub class_name: String,
    pub score: f64,
    /// Margin-expanded crop of the detection.
    pub crop: DynamicImage,
}

/// Accumulated wall-clock inference durations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferenceTimes {
    count: u32,
    total: Duration,
}

impl InferenceTimes {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }

    pub fn summary(&self) -> InferenceTimesSummary {
        InferenceTimesSummary {
            count: self.count,
            total_s: self.total.as_secs_f64(),
            average_s: self.average().as_secs_f64(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InferenceTimesSummary {
    pub count: u32,
    pub total_s: f64,
    pub average_s: f64,
}

/// Content of the `pollinator_inference` metadata section.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InferenceMetadata {
    pub model_name: String,
    pub backend: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub margin: u32,
    pub multi_label: bool,
    pub multi_label_iou_threshold: f32,
    pub max_detections: usize,
    pub augment: bool,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub inference_times: InferenceTimesSummary,
}

impl InferenceMetadata {
    pub fn new(
        backend: &str,
        settings: &super::ModelSettings,
        times: &InferenceTimes,
    ) -> Self {
        Self {
            model_name: settings.model_name(),
            backend: backend.to_string(),
            confidence_threshold: settings.confidence_threshold,
            iou_threshold: settings.iou_threshold,
            margin: settings.margin,
            multi_label: settings.multi_label,
            multi_label_iou_threshold: settings.multi_label_iou_threshold,
            max_detections: settings.max_detections,
            augment: settings.augment,
            input_size: settings.input_size,
            class_names: settings.class_names.clone(),
            inference_times: times.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_recorded_times() {
        let mut times = InferenceTimes::default();
        assert_eq!(times.average(), Duration::ZERO);
        times.record(Duration::from_millis(30));
        times.record(Duration::from_millis(50));
        assert_eq!(times.count(), 2);
        assert_eq!(times.total(), Duration::from_millis(80));
        assert_eq!(times.average(), Duration::from_millis(40));

        let summary = times.summary();
        assert!((summary.total_s - 0.08).abs() < 1e-9);

        times.reset();
        assert_eq!(times.count(), 0);
        assert_eq!(times.total(), Duration::ZERO);
    }
}
