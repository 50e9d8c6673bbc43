// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the broker client cache

#[cfg(test)]
mod tests {
    use crate::osb::manager::{BrokerClientManager, ClientFactory};
    use crate::osb::{AuthConfig, BrokerClient, ClientConfig, HttpBrokerClient, OsbError};
    use crate::store::ObjectKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_factory(builds: Arc<AtomicUsize>) -> ClientFactory {
        Arc::new(move |config: &ClientConfig| {
            builds.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn BrokerClient> = Arc::new(HttpBrokerClient::new(config)?);
            Ok(client)
        })
    }

    #[test]
    fn test_client_is_reused_while_config_is_unchanged() {
        let builds = Arc::new(AtomicUsize::new(0));
        let manager = BrokerClientManager::with_factory(counting_factory(Arc::clone(&builds)));
        let key = ObjectKey::cluster("broker-a");
        let config = ClientConfig::new("broker-a", "http://broker-a.example.com");

        let first = manager.get_or_create(&key, &config).unwrap();
        let second = manager.get_or_create(&key, &config).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_client_is_rebuilt_when_credentials_rotate() {
        let builds = Arc::new(AtomicUsize::new(0));
        let manager = BrokerClientManager::with_factory(counting_factory(Arc::clone(&builds)));
        let key = ObjectKey::namespaced("team-a", "broker-a");
        let mut config = ClientConfig::new("broker-a", "http://broker-a.example.com");
        manager.get_or_create(&key, &config).unwrap();

        config.auth = Some(AuthConfig::Bearer {
            token: "rotated".to_string(),
        });
        manager.get_or_create(&key, &config).unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_brokers_are_cached_independently() {
        let manager = BrokerClientManager::new();
        let config = ClientConfig::new("b", "http://broker.example.com");
        manager
            .get_or_create(&ObjectKey::cluster("b"), &config)
            .unwrap();
        manager
            .get_or_create(&ObjectKey::namespaced("ns", "b"), &config)
            .unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_factory_error_is_not_cached() {
        let manager = BrokerClientManager::new();
        let key = ObjectKey::cluster("bad");
        let config = ClientConfig::new("bad", "::not-a-url::");

        let err = manager.get_or_create(&key, &config).err().unwrap();
        assert!(matches!(err, OsbError::Config(_)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_remove() {
        let manager = BrokerClientManager::new();
        let key = ObjectKey::cluster("b");
        let config = ClientConfig::new("b", "http://broker.example.com");
        manager.get_or_create(&key, &config).unwrap();

        manager.remove(&key);
        assert!(manager.is_empty());
        // Removing twice is fine.
        manager.remove(&key);
    }
}
