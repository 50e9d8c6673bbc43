// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Background polling of asynchronous broker operations.
//!
//! One task runs per [`PollTarget`]. It sleeps with exponential backoff (1s
//! doubling to 1h, ±10% jitter by default), calls `last_operation`, stores the
//! answer and queues a reconcile tick for the owning entity. The reconciler reads
//! the answer with [`Poller::take_outcome`] and decides what happens next.
//!
//! A task ends on its own after a terminal answer (`succeeded`, `failed`, gone or
//! a non-retryable error). [`Poller::stop`] ends it early; transient errors are
//! logged and polled again after the next backoff step.

use crate::metrics::Metrics;
use crate::osb::{BrokerClient, LastOperationRequest, LastOperationState, OsbError};
use crate::queue::WorkQueue;
use crate::reconcilers::retry::poll_backoff;
use crate::store::ObjectKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Entity whose asynchronous operation is being polled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PollTarget {
    Instance(ObjectKey),
    Binding(ObjectKey),
}

impl PollTarget {
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Instance(key) | Self::Binding(key) => key,
        }
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(key) => write!(f, "ServiceInstance {key}"),
            Self::Binding(key) => write!(f, "ServiceBinding {key}"),
        }
    }
}

/// Latest answer from a `last_operation` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    InProgress { description: Option<String> },
    Succeeded { description: Option<String> },
    Failed { description: Option<String> },
    /// 410: the resource no longer exists on the broker.
    Gone,
    /// Non-retryable error from the endpoint.
    Error(OsbError),
}

impl PollOutcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }

    fn from_response(result: Result<crate::osb::LastOperationResponse, OsbError>) -> Option<Self> {
        match result {
            Ok(response) => Some(match response.state {
                LastOperationState::InProgress => Self::InProgress {
                    description: response.description,
                },
                LastOperationState::Succeeded => Self::Succeeded {
                    description: response.description,
                },
                LastOperationState::Failed => Self::Failed {
                    description: response.description,
                },
            }),
            Err(e) if e.is_gone() => Some(Self::Gone),
            Err(e) if e.is_retryable() => None,
            Err(e) => Some(Self::Error(e)),
        }
    }
}

struct Task {
    id: u64,
    operation_key: Option<String>,
    stop: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<PollTarget, Task>,
    outcomes: HashMap<PollTarget, PollOutcome>,
    shutting_down: bool,
}

/// Registry of running poll tasks.
#[derive(Clone)]
pub struct Poller {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
    initial: Duration,
    max: Duration,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("initial", &self.initial)
            .field("max", &self.max)
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl Poller {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_id: Arc::new(AtomicU64::new(0)),
            initial,
            max,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start polling `target` unless a task for the same operation is already running.
    ///
    /// A running task for a different operation is stopped first. Every answer is
    /// followed by `queue.add(target.key())`.
    pub fn start(
        &self,
        target: PollTarget,
        client: Arc<dyn BrokerClient>,
        request: LastOperationRequest,
        queue: WorkQueue<ObjectKey>,
    ) {
        let (stop, mut stopped) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(running) = state.tasks.get(&target) {
                if running.operation_key == request.operation_key {
                    return;
                }
            }
            if let Some(previous) = state.tasks.remove(&target) {
                let _ = previous.stop.send(());
                self.metrics.poller_active_tasks.dec();
            }
            state.outcomes.remove(&target);
            state.tasks.insert(
                target.clone(),
                Task {
                    id,
                    operation_key: request.operation_key.clone(),
                    stop,
                },
            );
        }
        self.metrics.poller_active_tasks.inc();
        debug!(target = %target, operation = ?request.operation_key, "Starting last_operation poller");

        let poller = self.clone();
        tokio::spawn(async move {
            let mut backoff = poll_backoff(poller.initial, poller.max);
            loop {
                let delay = backoff.next_backoff().unwrap_or(poller.max);
                tokio::select! {
                    _ = &mut stopped => {
                        debug!(target = %target, "Poller stopped");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                let result = match &target {
                    PollTarget::Instance(_) => client.poll_last_operation(&request).await,
                    PollTarget::Binding(_) => client.poll_binding_last_operation(&request).await,
                };
                poller.metrics.record_osb_request("last_operation", &result);

                let Some(outcome) = PollOutcome::from_response(result.clone()) else {
                    if let Err(e) = &result {
                        warn!(target = %target, error = %e, "Transient error polling last_operation, will retry");
                    }
                    continue;
                };
                let terminal = outcome.is_terminal();
                if !poller.record(&target, id, outcome) {
                    return;
                }
                queue.add(target.key().clone());
                if terminal {
                    info!(target = %target, "Asynchronous operation reached a terminal state");
                    poller.finish(&target, id);
                    return;
                }
            }
        });
    }

    /// Store an outcome from task `id`; false when the task has been replaced.
    fn record(&self, target: &PollTarget, id: u64, outcome: PollOutcome) -> bool {
        let mut state = self.lock();
        if state.tasks.get(target).is_none_or(|task| task.id != id) {
            return false;
        }
        state.outcomes.insert(target.clone(), outcome);
        true
    }

    fn finish(&self, target: &PollTarget, id: u64) {
        let mut state = self.lock();
        if state.tasks.get(target).is_some_and(|task| task.id == id) {
            state.tasks.remove(target);
            self.metrics.poller_active_tasks.dec();
        }
    }

    /// Remove and return the latest answer for `target`.
    pub fn take_outcome(&self, target: &PollTarget) -> Option<PollOutcome> {
        self.lock().outcomes.remove(target)
    }

    #[must_use]
    pub fn is_polling(&self, target: &PollTarget) -> bool {
        self.lock().tasks.contains_key(target)
    }

    /// Stop the task for `target` and drop any unread answer.
    pub fn stop(&self, target: &PollTarget) {
        let mut state = self.lock();
        state.outcomes.remove(target);
        if let Some(task) = state.tasks.remove(target) {
            let _ = task.stop.send(());
            self.metrics.poller_active_tasks.dec();
        }
    }

    /// Stop every task and refuse new ones.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.outcomes.clear();
        for (_, task) in state.tasks.drain() {
            let _ = task.stop.send(());
            self.metrics.poller_active_tasks.dec();
        }
    }

    /// Number of running tasks.
    #[must_use]
    pub fn active(&self) -> usize {
        self.lock().tasks.len()
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod poller_tests;
