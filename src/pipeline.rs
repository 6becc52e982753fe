//! Worker loop: pop a batch, run the pollinator model over every flower crop,
//! hand the result to the sinks, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::GenericImageView;

use crate::detect::PollinatorModel;
use crate::message::{
    parse_batch, DetectionBatch, Flower, Pollinator, ResultBatch, FLOWER_SECTION,
    POLLINATOR_SECTION,
};
use crate::queue::{Connector, Opcode, QueueClient, QueueError, QueueStatus, Reply};
use crate::sink::{FanoutReport, SinkFanout};

pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Turns per-crop local pollinator indices into batch-wide ones.
///
/// Each crop's indices are shifted by the running offset, and the offset then
/// moves past the largest local index. Gaps in the local numbering therefore
/// carry over, and indices never collide across crops.
#[derive(Clone, Debug, Default)]
pub struct IndexAllocator {
    next: u32,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u32 {
        self.next
    }

    pub fn allocate(&mut self, local: &[u32]) -> Vec<u32> {
        let base = self.next;
        if let Some(max) = local.iter().max() {
            self.next = base + max + 1;
        }
        local.iter().map(|i| base + i).collect()
    }
}

/// What one loop iteration did.
#[derive(Debug)]
pub enum Iteration {
    Processed(ProcessedBatch),
    /// The reply could not be used and was discarded.
    Dropped,
    /// The queue was empty.
    Idle,
    /// The server acknowledged a removal.
    Acknowledged,
}

#[derive(Debug)]
pub struct ProcessedBatch {
    pub node_id: String,
    pub flowers: usize,
    pub pollinators: usize,
    pub report: FanoutReport,
}

pub struct Pipeline<C: Connector> {
    queue: QueueClient<C>,
    model: Box<dyn PollinatorModel>,
    sinks: SinkFanout,
    idle_backoff: Duration,
}

impl<C: Connector> Pipeline<C> {
    pub fn new(
        queue: QueueClient<C>,
        model: Box<dyn PollinatorModel>,
        sinks: SinkFanout,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            queue,
            model,
            sinks,
            idle_backoff,
        }
    }

    /// Loop until `shutdown` is set or the queue server is gone.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), QueueError> {
        log::info!(
            "worker started: queue {}, model {}, sinks [{}]",
            self.queue.endpoint(),
            self.model.name(),
            self.sinks.names().join(", ")
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.iterate(shutdown) {
                Ok(Iteration::Idle) => {
                    log::info!("no data available");
                    self.idle(shutdown);
                }
                Ok(_) => {}
                Err(e) if e.is_interrupted() => break,
                Err(e) => return Err(e),
            }
        }
        log::info!("shutdown requested, leaving worker loop");
        self.queue.disconnect();
        Ok(())
    }

    /// One request/reply round trip plus whatever processing the reply needs.
    /// Only retry exhaustion is returned as an error.
    pub fn run_once(&mut self) -> Result<Iteration, QueueError> {
        self.iterate(&AtomicBool::new(false))
    }

    /// As [`run_once`](Self::run_once), abandoning the request retries once
    /// `shutdown` is set.
    fn iterate(&mut self, shutdown: &AtomicBool) -> Result<Iteration, QueueError> {
        let reply = match self.queue.request_until(Opcode::Pop, shutdown) {
            Ok(reply) => reply,
            Err(e) if e.is_fatal() || e.is_interrupted() => return Err(e),
            Err(e) => {
                log::warn!("discarding queue reply: {}", e);
                return Ok(Iteration::Dropped);
            }
        };

        match reply {
            Reply::Status(QueueStatus::Empty) => Ok(Iteration::Idle),
            Reply::Status(QueueStatus::Removed) => {
                log::debug!("queue server acknowledged removal");
                Ok(Iteration::Acknowledged)
            }
            Reply::Batch(value) => {
                let batch = match parse_batch(&value) {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("dropping message: {}", e);
                        return Ok(Iteration::Dropped);
                    }
                };
                match self.handle_batch(batch) {
                    Ok(processed) => Ok(Iteration::Processed(processed)),
                    Err(e) => {
                        log::error!("dropping batch that could not be encoded: {:#}", e);
                        Ok(Iteration::Dropped)
                    }
                }
            }
        }
    }

    fn handle_batch(&mut self, batch: DetectionBatch) -> Result<ProcessedBatch> {
        log::info!(
            "got data from {}, recorded at {}, contains {} flowers",
            batch.node_id,
            batch.captured_at,
            batch.num_detections()
        );
        let result = process_batch(self.model.as_mut(), batch)?;
        let node_id = result.node_id.clone();
        let flowers = result.flowers.len();
        let pollinators = result.pollinators.len();
        let message = result.into_message()?;
        let report = self.sinks.deliver(&message);
        log::info!(
            "processed batch from {}: {} flowers, {} pollinators, {}/{} sinks ok",
            node_id,
            flowers,
            pollinators,
            report.outcomes.len() - report.failures().count(),
            report.outcomes.len()
        );
        Ok(ProcessedBatch {
            node_id,
            flowers,
            pollinators,
            report,
        })
    }

    fn idle(&self, shutdown: &AtomicBool) {
        let until = Instant::now() + self.idle_backoff;
        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep((until - now).min(SHUTDOWN_POLL));
        }
    }
}

/// Run `model` over every flower crop of `batch` and assemble the result.
///
/// A crop the model fails on still appears as a flower, just without
/// pollinators.
pub fn process_batch(model: &mut dyn PollinatorModel, batch: DetectionBatch) -> Result<ResultBatch> {
    let mut result = ResultBatch::new(batch.node_id.clone(), batch.captured_at);
    let mut indices = IndexAllocator::new();
    model.reset_inference_times();

    for (flower_index, flower) in batch.detections.iter().enumerate() {
        let flower_index = flower_index as u32;
        let (width, height) = flower.image.dimensions();
        result.add_flower(Flower {
            index: flower_index,
            class_name: flower.class_name.clone(),
            score: flower.score,
            width,
            height,
        });

        let detections = match model.predict(&flower.image) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!(
                    "model {} failed on flower {} of node {}: {:#}",
                    model.name(),
                    flower_index,
                    batch.node_id,
                    e
                );
                continue;
            }
        };
        let local: Vec<u32> = detections.iter().map(|d| d.index).collect();
        let global = indices.allocate(&local);
        for (detection, index) in detections.into_iter().zip(global) {
            let (width, height) = detection.crop.dimensions();
            result.add_pollinator(Pollinator {
                index,
                flower_index,
                class_name: detection.class_name,
                score: detection.score,
                width,
                height,
                crop: detection.crop,
            });
        }
    }

    let times = model.metadata().inference_times;
    log::info!(
        "inference times [total, avg]: [{:.3}s, {:.3}s]",
        times.total_s,
        times.average_s
    );
    result.add_metadata(POLLINATOR_SECTION, &model.metadata())?;
    result.add_metadata(FLOWER_SECTION, &batch.metadata)?;
    Ok(result)
}
