//! Stuck-task watchdog.
//!
//! Workers can hang in ways their own deadline never catches (a blocked
//! cooperative loop does not poll its timeout). The watchdog scans the
//! in-progress index on a fixed period and requeues anything older than the
//! stuck threshold, bounding time-to-recovery for every reference.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::queue::TaskQueue;
use crate::store::CheckpointStore;

pub struct Watchdog {
    queue: Arc<TaskQueue>,
    checkpoint: Arc<CheckpointStore>,
    interval: Duration,
    stuck_threshold: Duration,
}

impl Watchdog {
    pub fn new(
        queue: Arc<TaskQueue>,
        checkpoint: Arc<CheckpointStore>,
        interval: Duration,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            queue,
            checkpoint,
            interval,
            stuck_threshold,
        }
    }

    /// Run until the queue drains.
    pub async fn run(self) {
        info!(
            interval = ?self.interval,
            threshold = ?self.stuck_threshold,
            "watchdog started"
        );
        loop {
            sleep(self.interval).await;

            let stats = self.queue.stats().await;
            if stats.drained() {
                break;
            }

            for reference in self.queue.stuck(self.stuck_threshold).await {
                warn!(
                    reference,
                    threshold = ?self.stuck_threshold,
                    "reference stuck in progress, recovering"
                );
                self.queue.recover(&reference).await;
            }

            if self.checkpoint.snapshot().await.is_stalled() {
                warn!("run is stalling: repeated failures without a success");
            }

            info!(
                pending = stats.pending,
                in_progress = stats.in_progress,
                completed = stats.completed,
                failed = stats.failed,
                "progress"
            );
        }
        info!("watchdog exiting: queue drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn checkpoint() -> Arc<CheckpointStore> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::load_or_init(dir.path().join("checkpoint.json")).unwrap();
        Arc::new(store)
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_stuck_reference_within_one_period() {
        let queue = Arc::new(TaskQueue::new(vec!["165199".to_string()]));
        let watchdog = Watchdog::new(
            queue.clone(),
            checkpoint(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let watchdog_task = tokio::spawn(watchdog.run());

        // A worker takes the reference and goes silent.
        let taken = queue.get(0).await.unwrap();
        assert_eq!(taken, "165199");
        tokio::task::yield_now().await;

        // Within threshold + one period the reference is pending again.
        tokio::time::advance(Duration::from_secs(66)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 0);

        // Another worker finishes it; the watchdog then exits on drain.
        let reference = queue.get(1).await.unwrap();
        queue.complete(&reference).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        watchdog_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_work_is_not_recovered() {
        let queue = Arc::new(TaskQueue::new(vec!["165199".to_string()]));
        let watchdog = Watchdog::new(
            queue.clone(),
            checkpoint(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        let watchdog_task = tokio::spawn(watchdog.run());

        let reference = queue.get(0).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // Still held: age is far below the stuck threshold.
        assert_eq!(queue.stats().await.in_progress, 1);

        queue.complete(&reference).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        watchdog_task.await.unwrap();
    }
}
