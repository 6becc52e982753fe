use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::template::check_node_id;
use super::ResultSink;
use crate::message::OutboundMessage;

/// Writes each result to `{base_dir}/{node}/{date}/{hour}/{node}_{timestamp}.json`.
///
/// A second result for the same node and second overwrites the first.
#[derive(Clone, Debug)]
pub struct FileSink {
    base_dir: PathBuf,
    save_crops: bool,
}

impl FileSink {
    pub fn new(base_dir: impl Into<PathBuf>, save_crops: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            save_crops,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Destination of `message`.
    pub fn path_for(&self, message: &OutboundMessage) -> Result<PathBuf> {
        check_node_id(&message.node_id)?;
        Ok(self
            .base_dir
            .join(message.relative_dir())
            .join(message.filename()))
    }

    pub fn store(&self, message: &OutboundMessage) -> Result<PathBuf> {
        let path = self.path_for(message)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create result directory {}", dir.display()))?;
        }
        let body = message.render(self.save_crops)?;
        std::fs::write(&path, body)
            .with_context(|| format!("write result file {}", path.display()))?;
        log::info!("stored result of {} at {}", message.node_id, path.display());
        Ok(path)
    }
}

impl ResultSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn deliver(&mut self, message: &OutboundMessage) -> Result<()> {
        self.store(message).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Pollinator, ResultBatch};
    use chrono::DateTime;
    use image::{DynamicImage, RgbImage};

    fn message(node_id: &str) -> OutboundMessage {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:22:00Z").unwrap();
        let mut batch = ResultBatch::new(node_id, ts);
        batch.add_pollinator(Pollinator {
            index: 0,
            flower_index: 0,
            class_name: "honeybee".into(),
            score: 0.77,
            width: 4,
            height: 4,
            crop: DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
        });
        batch.into_message().unwrap()
    }

    #[test]
    fn writes_into_hourly_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path(), true);
        let path = sink.store(&message("n1")).unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("n1/2024-03-05/14/n1_2024-03-05T14-22-00Z.json")
        );
        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(stored["detections"]["pollinators"][0]["crop"].is_string());
    }

    #[test]
    fn same_node_and_second_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path(), false);
        sink.deliver(&message("n1")).unwrap();
        let path = sink.store(&message("n1")).unwrap();
        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(stored["detections"]["pollinators"][0]["crop"].is_null());
        let hour_dir = path.parent().unwrap();
        assert_eq!(std::fs::read_dir(hour_dir).unwrap().count(), 1);
    }

    #[test]
    fn refuses_escaping_node_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path(), true);
        for bad in ["../up", "a/b", "..", "", "n#1"] {
            assert!(sink.store(&message(bad)).is_err(), "{bad:?}");
        }
    }
}
