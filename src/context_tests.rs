// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `context.rs`

#[cfg(test)]
mod tests {
    use crate::context::{Context, Queues, Settings, QUEUE_SERVICE_INSTANCES};
    use crate::metrics::Metrics;
    use crate::osb::BrokerClientManager;
    use crate::store::{ObjectKey, Stores};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.osb_api_version, "2.13");
        assert_eq!(settings.osb_timeout, Duration::from_secs(15));
        assert_eq!(settings.poll_initial, Duration::from_secs(1));
        assert_eq!(settings.poll_max, Duration::from_secs(3600));
        assert_eq!(settings.orphan_mitigation_attempts, 7);
        assert_eq!(
            settings.reconciliation_retry_duration,
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(settings.queue_base_delay, Duration::from_millis(100));
        assert_eq!(settings.queue_max_delay, Duration::from_secs(600));
    }

    #[test]
    fn test_queue_names() {
        let queues = Queues::new(Duration::from_millis(1), Duration::from_millis(2));
        assert_eq!(queues.service_instances.name(), QUEUE_SERVICE_INSTANCES);
        assert_eq!(queues.cluster_service_brokers.name(), "cluster-service-brokers");
        assert_eq!(queues.service_bindings.name(), "service-bindings");
    }

    #[tokio::test]
    async fn test_shut_down_stops_queues_and_poller() {
        let ctx = Context::new(
            Stores::in_memory(),
            BrokerClientManager::new(),
            Arc::new(Metrics::new().unwrap()),
            Settings::default(),
        );
        ctx.queues.service_instances.add(ObjectKey::namespaced("ns", "a"));
        ctx.shut_down();

        assert!(ctx.queues.service_instances.is_shutting_down());
        assert!(ctx.queues.service_brokers.is_shutting_down());
        assert_eq!(ctx.queues.service_instances.get().await, None);
        assert_eq!(ctx.queues.in_flight(), 0);
        assert_eq!(ctx.poller.active(), 0);
    }
}
