// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for all reconcilers.
//!
//! Every reconciler receives an `Arc<Context>` that contains:
//! - the entity stores for every kind
//! - the per-broker OSB client cache
//! - the poller and the work queues its ticks land in
//! - the credential injector
//! - the metrics registry
//! - engine settings derived from the command line
//!
//! Everything here is built once at startup and passed down explicitly.

use crate::constants::{
    DEFAULT_OSB_API_VERSION, DEFAULT_OSB_TIMEOUT_SECS, DEFAULT_ORPHAN_MITIGATION_ATTEMPTS,
    DEFAULT_POLL_INITIAL_SECS, DEFAULT_POLL_MAX_SECS, DEFAULT_RECONCILIATION_RETRY_DURATION_SECS,
    DEFAULT_RELIST_DURATION_SECS, QUEUE_BASE_DELAY_MILLIS, QUEUE_MAX_DELAY_SECS,
};
use crate::injector::CredentialInjector;
use crate::metrics::Metrics;
use crate::osb::BrokerClientManager;
use crate::poller::Poller;
use crate::queue::WorkQueue;
use crate::store::{ObjectKey, Stores};
use std::sync::Arc;
use std::time::Duration;

/// Queue names, also used as the `queue` metric label.
pub const QUEUE_CLUSTER_SERVICE_BROKERS: &str = "cluster-service-brokers";
pub const QUEUE_SERVICE_BROKERS: &str = "service-brokers";
pub const QUEUE_SERVICE_INSTANCES: &str = "service-instances";
pub const QUEUE_SERVICE_BINDINGS: &str = "service-bindings";

/// Engine tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Reported to brokers as `organization_guid` and `context.clusterid`.
    pub cluster_id: String,
    pub osb_api_version: String,
    pub osb_timeout: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
    /// Deprovision attempts before orphan mitigation gives up.
    pub orphan_mitigation_attempts: u32,
    /// How long an operation may keep failing before it is abandoned.
    pub reconciliation_retry_duration: Duration,
    /// Relist interval for `Duration` brokers without `relistDuration`.
    pub default_relist_interval: Duration,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            osb_api_version: DEFAULT_OSB_API_VERSION.to_string(),
            osb_timeout: Duration::from_secs(DEFAULT_OSB_TIMEOUT_SECS),
            poll_initial: Duration::from_secs(DEFAULT_POLL_INITIAL_SECS),
            poll_max: Duration::from_secs(DEFAULT_POLL_MAX_SECS),
            orphan_mitigation_attempts: DEFAULT_ORPHAN_MITIGATION_ATTEMPTS,
            reconciliation_retry_duration: Duration::from_secs(
                DEFAULT_RECONCILIATION_RETRY_DURATION_SECS,
            ),
            default_relist_interval: Duration::from_secs(DEFAULT_RELIST_DURATION_SECS),
            queue_base_delay: Duration::from_millis(QUEUE_BASE_DELAY_MILLIS),
            queue_max_delay: Duration::from_secs(QUEUE_MAX_DELAY_SECS),
        }
    }
}

/// One work queue per reconciled kind.
#[derive(Clone, Debug)]
pub struct Queues {
    pub cluster_service_brokers: WorkQueue<ObjectKey>,
    pub service_brokers: WorkQueue<ObjectKey>,
    pub service_instances: WorkQueue<ObjectKey>,
    pub service_bindings: WorkQueue<ObjectKey>,
}

impl Queues {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let queue = |name| WorkQueue::with_rate_limit(name, base_delay, max_delay);
        Self {
            cluster_service_brokers: queue(QUEUE_CLUSTER_SERVICE_BROKERS),
            service_brokers: queue(QUEUE_SERVICE_BROKERS),
            service_instances: queue(QUEUE_SERVICE_INSTANCES),
            service_bindings: queue(QUEUE_SERVICE_BINDINGS),
        }
    }

    fn all(&self) -> [&WorkQueue<ObjectKey>; 4] {
        [
            &self.cluster_service_brokers,
            &self.service_brokers,
            &self.service_instances,
            &self.service_bindings,
        ]
    }

    /// Stop handing out keys on every queue.
    pub fn shut_down(&self) {
        for queue in self.all() {
            queue.shut_down();
        }
    }

    /// Keys held by workers across all queues.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.all().iter().map(|q| q.in_flight()).sum()
    }
}

/// Shared state handed to every reconciler.
#[derive(Clone)]
pub struct Context {
    pub stores: Stores,
    pub clients: BrokerClientManager,
    pub poller: Poller,
    pub queues: Queues,
    pub injector: CredentialInjector,
    pub metrics: Arc<Metrics>,
    pub settings: Settings,
}

impl Context {
    /// Wire up a context; the poller and queues are built from `settings`.
    #[must_use]
    pub fn new(
        stores: Stores,
        clients: BrokerClientManager,
        metrics: Arc<Metrics>,
        settings: Settings,
    ) -> Self {
        let poller = Poller::new(settings.poll_initial, settings.poll_max, Arc::clone(&metrics));
        let queues = Queues::new(settings.queue_base_delay, settings.queue_max_delay);
        let injector = CredentialInjector::new(Arc::clone(&stores.secrets));
        Self {
            stores,
            clients,
            poller,
            queues,
            injector,
            metrics,
            settings,
        }
    }

    /// Stop pollers and queues; in-flight passes run to completion.
    pub fn shut_down(&self) {
        self.poller.shutdown();
        self.queues.shut_down();
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
