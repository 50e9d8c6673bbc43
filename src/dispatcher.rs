// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Worker pool that drains a [`WorkQueue`] into a [`Reconciler`].
//!
//! Each kind gets one dispatcher with `concurrency` workers. The queue never hands
//! the same key to two workers at once, so a reconciler sees every entity strictly
//! serially. What happens to a key after a pass depends on the outcome:
//!
//! - `Ok(action)`: backoff is reset; the key comes back after
//!   `action.requeue_after` if set
//! - terminal error (`Validation`, `RemoteTerminal`): backoff is reset and the key
//!   waits for the next watch event
//! - `Poison`: the key comes back at the backoff ceiling
//! - anything else, and passes that exceed the timeout: per-key exponential backoff

use crate::constants::QUEUE_MAX_DELAY_SECS;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::ReconcileError;
use crate::store::ObjectKey;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What to do with a key after a successful pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration` even without a change.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next change to the object or one of its collaborators.
    #[must_use]
    pub fn await_change() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// One control loop.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind name used in logs and metric labels.
    fn kind(&self) -> &'static str;

    /// Move the entity at `key` one step toward its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

/// Runs `concurrency` workers over one queue.
#[derive(Clone)]
pub struct Dispatcher {
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue<ObjectKey>,
    concurrency: usize,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        queue: WorkQueue<ObjectKey>,
        concurrency: usize,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            concurrency: concurrency.max(1),
            timeout,
            metrics,
        }
    }

    /// Process keys until the queue is shut down and every in-flight pass is done.
    pub async fn run(self) {
        let kind = self.reconciler.kind();
        info!(kind, workers = self.concurrency, "Starting dispatcher");

        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let dispatcher = self.clone();
            workers.spawn(async move { dispatcher.work(worker).await });
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(kind, error = %e, "Dispatcher worker terminated abnormally");
            }
        }
        info!(kind, "Dispatcher stopped");
    }

    async fn work(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            self.metrics.set_queue_depth(self.queue.name(), self.queue.len());
            debug!(kind = self.reconciler.kind(), worker, key = %key, "Processing");
            self.process(&key).await;
            self.queue.done(&key);
        }
    }

    /// Run one pass for `key` and apply the requeue policy.
    pub async fn process(&self, key: &ObjectKey) {
        let kind = self.reconciler.kind();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.reconciler.reconcile(key)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(action)) => {
                self.metrics.record_reconciliation_success(kind, elapsed);
                self.queue.forget(key);
                if let Some(after) = action.requeue_after() {
                    debug!(kind, key = %key, after = ?after, "Requeueing");
                    self.metrics.record_requeue(kind, "scheduled");
                    self.queue.add_after(key.clone(), after);
                }
            }
            Ok(Err(err)) => {
                self.metrics
                    .record_reconciliation_error(kind, err.category(), elapsed);
                self.handle_error(key, &err);
            }
            Err(_) => {
                self.metrics.record_reconciliation_timeout(kind, elapsed);
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    kind,
                    key = %key,
                    timeout = ?self.timeout,
                    retry_in = ?delay,
                    "Reconcile timed out"
                );
                self.metrics.record_requeue(kind, "timeout");
            }
        }
    }

    fn handle_error(&self, key: &ObjectKey, err: &ReconcileError) {
        let kind = self.reconciler.kind();
        match err {
            _ if err.is_terminal() => {
                self.queue.forget(key);
                warn!(
                    kind,
                    key = %key,
                    reason = err.reason(),
                    error = %err,
                    "Reconcile failed terminally; waiting for a change"
                );
            }
            ReconcileError::Poison(_) => {
                error!(kind, key = %key, error = %err, "Cannot process stored object");
                self.metrics.record_requeue(kind, "poison");
                self.queue
                    .add_after(key.clone(), Duration::from_secs(QUEUE_MAX_DELAY_SECS));
            }
            _ => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    kind,
                    key = %key,
                    reason = err.reason(),
                    error = %err,
                    retry_in = ?delay,
                    "Reconcile failed, will retry"
                );
                self.metrics.record_requeue(kind, err.category());
            }
        }
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod dispatcher_tests;
