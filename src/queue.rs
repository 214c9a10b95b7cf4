//! In-memory task queue with retry and stuck-task recovery.
//!
//! The queue is the only arbiter of which worker processes which reference.
//! All state lives in one struct behind a single async mutex; a reference is
//! in exactly one of pending, in-progress, completed, or terminally failed
//! at any instant, and the four together always account for every reference
//! the queue was seeded with.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Bookkeeping for a reference currently held by a worker.
#[derive(Debug, Clone)]
pub struct InProgress {
    pub worker_id: usize,
    pub started_at: Instant,
    /// 1-based attempt number, counting prior failed attempts.
    pub attempt: u32,
}

/// Outcome of reporting a failure to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The reference went back onto the pending queue.
    Requeued { next_attempt: u32 },
    /// Retries are exhausted; the reference will not be dispatched again.
    Terminal { attempts: u32 },
    /// Another worker already resolved this reference (it was recovered by
    /// the watchdog while this worker was stuck on it). Nothing to record.
    Superseded,
}

/// Point-in-time queue counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    /// No pending work and nothing held by a worker.
    pub fn drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    in_progress: HashMap<String, InProgress>,
    completed: HashSet<String>,
    /// Prior failed attempts per reference; absent means zero.
    retries: HashMap<String, u32>,
    terminal_failed: HashSet<String>,
}

/// Work distribution for one run.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    total: usize,
}

impl TaskQueue {
    pub fn new(references: Vec<String>) -> Self {
        let total = references.len();
        info!(total, "task queue initialized");
        Self {
            state: Mutex::new(QueueState {
                pending: references.into(),
                ..QueueState::default()
            }),
            total,
        }
    }

    /// Pop the next pending reference for `worker_id`, recording it as in
    /// progress. Returns `None` when nothing is pending; the caller uses
    /// [`TaskQueue::stats`] to distinguish "drained" from "wait and retry".
    pub async fn get(&self, worker_id: usize) -> Option<String> {
        let mut state = self.state.lock().await;
        let reference = state.pending.pop_front()?;
        let attempt = state.retries.get(&reference).copied().unwrap_or(0) + 1;
        state.in_progress.insert(
            reference.clone(),
            InProgress {
                worker_id,
                started_at: Instant::now(),
                attempt,
            },
        );
        Some(reference)
    }

    /// Record terminal success for `reference`. Returns false when the
    /// reference already has a terminal outcome, which happens when the
    /// watchdog recovered it from a stuck worker and a sibling finished it
    /// first; the caller must not record the duplicate.
    pub async fn complete(&self, reference: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.completed.contains(reference) || state.terminal_failed.contains(reference) {
            return false;
        }
        state.in_progress.remove(reference);
        state.retries.remove(reference);
        // A recovered copy may still sit in pending; completing wins.
        state.pending.retain(|r| r != reference);
        state.completed.insert(reference.to_string());
        true
    }

    /// Record a failed attempt by `worker_id`. The reference is requeued
    /// until it has failed `max_retries + 1` times, then parked as a
    /// terminal failure. A failure reported after the watchdog recovered
    /// the reference from this worker is stale and changes nothing: the
    /// reference is either requeued already or owned by a sibling.
    pub async fn fail(&self, reference: &str, worker_id: usize, max_retries: u32) -> FailOutcome {
        let mut state = self.state.lock().await;
        if state.completed.contains(reference) || state.terminal_failed.contains(reference) {
            return FailOutcome::Superseded;
        }
        match state.in_progress.get(reference) {
            Some(info) if info.worker_id == worker_id => {
                state.in_progress.remove(reference);
            }
            Some(_) => return FailOutcome::Superseded,
            None if state.pending.iter().any(|r| r == reference) => {
                return FailOutcome::Superseded;
            }
            None => {}
        }
        let attempts = state.retries.get(reference).copied().unwrap_or(0) + 1;
        if attempts <= max_retries {
            state.retries.insert(reference.to_string(), attempts);
            state.pending.push_back(reference.to_string());
            warn!(
                reference,
                attempt = attempts + 1,
                max = max_retries + 1,
                "requeued after failed attempt"
            );
            FailOutcome::Requeued {
                next_attempt: attempts + 1,
            }
        } else {
            state.retries.remove(reference);
            state.terminal_failed.insert(reference.to_string());
            warn!(reference, attempts, "failed permanently, will not requeue");
            FailOutcome::Terminal { attempts }
        }
    }

    /// References that have been in progress longer than `threshold`.
    pub async fn stuck(&self, threshold: Duration) -> Vec<String> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .in_progress
            .iter()
            .filter(|(_, info)| now.duration_since(info.started_at) > threshold)
            .map(|(reference, _)| reference.clone())
            .collect()
    }

    /// Pull a stuck reference out of the in-progress index and put it back
    /// at the head of the pending queue so recovery runs soon. Returns false
    /// if the reference was no longer in progress (its worker finished).
    pub async fn recover(&self, reference: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(info) = state.in_progress.remove(reference) else {
            return false;
        };
        warn!(
            reference,
            worker = info.worker_id,
            "recovering stuck reference"
        );
        state.pending.push_front(reference.to_string());
        true
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            total: self.total,
            pending: state.pending.len(),
            in_progress: state.in_progress.len(),
            completed: state.completed.len(),
            failed: state.terminal_failed.len(),
        }
    }

    pub async fn is_drained(&self) -> bool {
        self.stats().await.drained()
    }

    /// References parked as terminal failures, for the final report.
    pub async fn terminal_failures(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut failed: Vec<String> = state.terminal_failed.iter().cloned().collect();
        failed.sort();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("16{i:04}")).collect()
    }

    async fn assert_conserved(queue: &TaskQueue) {
        let stats = queue.stats().await;
        assert_eq!(
            stats.pending + stats.in_progress + stats.completed + stats.failed,
            stats.total,
            "queue state must account for every seeded reference"
        );
    }

    #[tokio::test]
    async fn get_complete_drains_in_order() {
        let queue = TaskQueue::new(refs(3));
        for expected in refs(3) {
            let got = queue.get(0).await.unwrap();
            assert_eq!(got, expected);
            assert!(queue.complete(&got).await);
            assert_conserved(&queue).await;
        }
        assert!(queue.get(0).await.is_none());
        assert!(queue.is_drained().await);
        assert_eq!(queue.stats().await.completed, 3);
    }

    #[tokio::test]
    async fn fail_requeues_until_retries_exhausted() {
        let queue = TaskQueue::new(vec!["160001".to_string()]);
        let max_retries = 2;

        let mut attempts = 0;
        loop {
            let Some(reference) = queue.get(0).await else {
                break;
            };
            attempts += 1;
            match queue.fail(&reference, 0, max_retries).await {
                FailOutcome::Requeued { next_attempt } => {
                    assert_eq!(next_attempt, attempts + 1);
                }
                FailOutcome::Terminal {
                    attempts: terminal_attempts,
                } => {
                    assert_eq!(terminal_attempts, max_retries + 1);
                }
                FailOutcome::Superseded => unreachable!("no recovery in this test"),
            }
            assert_conserved(&queue).await;
        }

        // Bounded attempts: exactly max_retries + 1.
        assert_eq!(attempts, max_retries + 1);
        let stats = queue.stats().await;
        assert!(stats.drained());
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(queue.terminal_failures().await, vec!["160001"]);
    }

    #[tokio::test]
    async fn attempt_numbers_count_prior_failures() {
        let queue = TaskQueue::new(vec!["160001".to_string()]);
        let r = queue.get(7).await.unwrap();
        queue.fail(&r, 7, 2).await;
        queue.get(8).await.unwrap();
        let state = queue.state.lock().await;
        assert_eq!(state.in_progress["160001"].attempt, 2);
        assert_eq!(state.in_progress["160001"].worker_id, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_detection_uses_age() {
        let queue = TaskQueue::new(refs(2));
        let first = queue.get(0).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = queue.get(1).await.unwrap();

        let stuck = queue.stuck(Duration::from_secs(5)).await;
        assert_eq!(stuck, vec![first.clone()]);
        assert!(!stuck.contains(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_requeues_at_head() {
        let queue = TaskQueue::new(refs(2));
        let first = queue.get(0).await.unwrap();
        tokio::time::advance(Duration::from_secs(400)).await;

        assert!(queue.recover(&first).await);
        assert_conserved(&queue).await;

        // Recovered reference dispatches before untouched pending work.
        assert_eq!(queue.get(1).await.unwrap(), first);

        // Recovering something no longer in progress is a no-op.
        assert!(!queue.recover(&first).await);
    }

    #[tokio::test(start_paused = true)]
    async fn late_outcomes_after_recovery_are_superseded() {
        let queue = TaskQueue::new(vec!["160001".to_string()]);

        // Worker 0 takes the reference and goes silent; the watchdog
        // recovers it and worker 1 completes it.
        let r = queue.get(0).await.unwrap();
        tokio::time::advance(Duration::from_secs(400)).await;
        assert!(queue.recover(&r).await);
        let again = queue.get(1).await.unwrap();
        assert!(queue.complete(&again).await);

        // Worker 0 finally reports: both outcomes are stale.
        assert!(!queue.complete(&r).await);
        assert_eq!(queue.fail(&r, 0, 2).await, FailOutcome::Superseded);

        let stats = queue.stats().await;
        assert!(stats.drained());
        assert_eq!(stats.completed, 1);
        assert_conserved(&queue).await;
    }

    #[tokio::test]
    async fn completed_references_never_requeue() {
        let queue = TaskQueue::new(vec!["160001".to_string()]);
        let r = queue.get(0).await.unwrap();
        queue.complete(&r).await;
        assert!(queue.get(0).await.is_none());
        assert!(queue.is_drained().await);
    }
}
