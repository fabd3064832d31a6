//! Background loops that live for the duration of one batch

use super::checkpoint::{BatchCheckpoint, CheckpointStore};
use super::state::BatchShared;
use crate::cancel::CancellationFlag;
use crate::resource::{ResourcePool, ScalingDecision};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Progress reporter and optional checkpoint writer for an active batch
pub(crate) struct BatchMonitor {
    stop: CancellationFlag,
    handles: Vec<JoinHandle<()>>,
}

/// Settings for [`BatchMonitor::start`]
pub(crate) struct MonitorSettings {
    pub(crate) batch_id: String,
    pub(crate) progress_interval: Duration,
    pub(crate) checkpoint_interval: Option<Duration>,
    pub(crate) max_parallel: usize,
    pub(crate) auto_scale_threshold: f64,
}

impl BatchMonitor {
    pub(crate) fn start(
        settings: MonitorSettings,
        shared: Arc<BatchShared>,
        pool: Arc<ResourcePool>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        let stop = CancellationFlag::new();
        let mut handles = Vec::new();

        {
            let shared = Arc::clone(&shared);
            let batch_id = settings.batch_id.clone();
            let max_parallel = settings.max_parallel.max(1);
            let threshold = settings.auto_scale_threshold;
            handles.push(spawn_ticker(
                settings.progress_interval,
                stop.clone(),
                move || {
                    report_progress(&shared, &pool, &batch_id, max_parallel, threshold);
                    async {}
                },
            ));
        }

        if let (Some(period), Some(store)) = (settings.checkpoint_interval, store) {
            let batch_id = settings.batch_id.clone();
            handles.push(spawn_ticker(period, stop.clone(), move || {
                let checkpoint = BatchCheckpoint::new(batch_id.clone(), shared.snapshot());
                let store = Arc::clone(&store);
                let batch_id = batch_id.clone();
                async move {
                    match store.save(&batch_id, &checkpoint).await {
                        Ok(()) => debug!(batch_id = %batch_id, "Wrote periodic checkpoint"),
                        Err(e) => warn!(batch_id = %batch_id, "Periodic checkpoint failed: {:#}", e),
                    }
                }
            }));
        }

        Self { stop, handles }
    }

    /// Stop every loop and wait for it to exit
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Batch monitor loop ended abnormally: {}", e);
            }
        }
    }
}

fn report_progress(
    shared: &BatchShared,
    pool: &ResourcePool,
    batch_id: &str,
    max_parallel: usize,
    threshold: f64,
) {
    let counts = shared.counts();
    let total = counts.total().max(1);
    info!(
        batch_id,
        finished = counts.finished(),
        total = counts.total(),
        running = counts.running,
        failed = counts.failed,
        percent = (counts.finished() * 100 / total) as u64,
        "Batch progress"
    );

    let ratio = counts.running as f64 / max_parallel as f64;
    if ratio > threshold {
        let decision = pool.consider_scaling(ratio);
        if decision != ScalingDecision::NoChange {
            info!(batch_id, ratio, ?decision, "Pool scaled under batch load");
        }
    }
}

fn spawn_ticker<F, Fut>(period: Duration, stop: CancellationFlag, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => break,
            }
            tick().await;
        }
    })
}
