// THEORY:
// Within one frame, regions are independent: each reads the prepared
// `FrameContext` and nothing else. `ParallelPipeline` exploits that with a
// small worker pool. A dispatcher hands region tasks to workers round-robin;
// every task carries a oneshot sender for its verdict, and the caller awaits
// the receivers in region order, so the verdict list comes back aligned with
// the region list no matter which worker finishes first.
//
// Frames themselves stay sequential. `process_frame` runs the prepare stage
// (which may fold the frame into an adaptive background) before any region
// task is sent, and callers are expected to await one frame before submitting
// the next.
//
// All pixel work, the prepare stage included, runs on tokio's blocking pool so
// the async workers stay responsive.

use crate::core_modules::calibrator::ThresholdTable;
use crate::error::{OccupancyError, OccupancyResult};
use crate::pipeline::{FrameContext, OccupancyPipeline, OccupancyVerdict};
use futures::future::join_all;
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub struct RegionTask {
    pub context: Arc<FrameContext>,
    pub region: usize,
    pub result_sender: oneshot::Sender<OccupancyResult<OccupancyVerdict>>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<RegionTask>,
    dispatcher: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the dispatcher and `worker_count` workers. Must be called from
    /// within a tokio runtime.
    pub fn new(pipeline: Arc<OccupancyPipeline>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<RegionTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<RegionTask>())
            .unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(task).is_err() {
                    warn!(worker = worker_idx, "region worker is gone, dropping task");
                }
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .map(|mut worker_receiver| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    while let Some(task) = worker_receiver.recv().await {
                        let verdict = Self::classify(Arc::clone(&pipeline), task.context, task.region).await;
                        let _ = task.result_sender.send(verdict);
                    }
                })
            })
            .collect();

        Self {
            task_sender,
            dispatcher,
            workers,
        }
    }

    async fn classify(
        pipeline: Arc<OccupancyPipeline>,
        context: Arc<FrameContext>,
        region: usize,
    ) -> OccupancyResult<OccupancyVerdict> {
        tokio::task::spawn_blocking(move || pipeline.classify_region(&context, region))
            .await
            .map_err(|e| OccupancyError::Worker(format!("region {region} task failed: {e}")))?
    }

    pub fn submit(
        &self,
        context: Arc<FrameContext>,
        region: usize,
    ) -> OccupancyResult<oneshot::Receiver<OccupancyResult<OccupancyVerdict>>> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(RegionTask {
                context,
                region,
                result_sender,
            })
            .map_err(|_| OccupancyError::Worker("failed to send task to worker pool".to_string()))?;
        Ok(result_receiver)
    }

    /// Stops accepting tasks and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        let _ = self.dispatcher.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

pub struct ParallelPipeline {
    pipeline: Arc<OccupancyPipeline>,
    worker_pool: WorkerPool,
    frame_counter: Mutex<u64>,
}

impl ParallelPipeline {
    /// Wraps `pipeline` with `config.worker_count` region workers. Must be
    /// called from within a tokio runtime.
    pub fn new(pipeline: OccupancyPipeline) -> Self {
        let worker_count = pipeline.config().worker_count;
        let pipeline = Arc::new(pipeline);
        let worker_pool = WorkerPool::new(Arc::clone(&pipeline), worker_count);
        Self {
            pipeline,
            worker_pool,
            frame_counter: Mutex::new(0),
        }
    }

    pub fn pipeline(&self) -> &Arc<OccupancyPipeline> {
        &self.pipeline
    }

    /// Classifies every region of `frame` across the worker pool. Verdicts are
    /// returned in region order.
    pub async fn process_frame(&self, frame: &RgbImage) -> OccupancyResult<Vec<OccupancyVerdict>> {
        let frame_id = {
            let mut counter = self.frame_counter.lock();
            let id = *counter;
            *counter += 1;
            id
        };
        let started = Instant::now();

        let pipeline = Arc::clone(&self.pipeline);
        let owned = frame.clone();
        let context = tokio::task::spawn_blocking(move || pipeline.prepare_owned(owned))
            .await
            .map_err(|e| OccupancyError::Worker(format!("prepare task for frame {frame_id} failed: {e}")))??;
        let context = Arc::new(context);
        let receivers = (0..self.pipeline.regions().len())
            .map(|region| self.worker_pool.submit(Arc::clone(&context), region))
            .collect::<OccupancyResult<Vec<_>>>()?;

        let verdicts = join_all(receivers)
            .await
            .into_iter()
            .enumerate()
            .map(|(region, received)| {
                received.map_err(|_| {
                    OccupancyError::Worker(format!("no result received for region {region}"))
                })?
            })
            .collect::<OccupancyResult<Vec<_>>>()?;

        debug!(
            frame = frame_id,
            regions = verdicts.len(),
            occupied = verdicts.iter().filter(|v| v.occupied).count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "frame classified"
        );
        Ok(verdicts)
    }

    /// Recalibrates off the async workers; detection keeps running on the
    /// previous table until the new one is swapped in.
    pub async fn calibrate(&self, samples: Vec<RgbImage>) -> OccupancyResult<Arc<ThresholdTable>> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.calibrate(&samples))
            .await
            .map_err(|e| OccupancyError::Worker(format!("calibration task failed: {e}")))?
    }

    pub fn frames_processed(&self) -> u64 {
        *self.frame_counter.lock()
    }

    pub async fn shutdown(self) {
        self.worker_pool.shutdown().await;
    }
}
