// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-broker client cache.
//!
//! Reconcilers ask for a client on every pass. A client is only rebuilt when the
//! broker's [`ClientConfig`] changes (new URL, rotated credentials, new CA bundle),
//! so connection pools survive between passes.

use super::{BrokerClient, ClientConfig, HttpBrokerClient, OsbError};
use crate::store::ObjectKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Builds a client from configuration.
pub type ClientFactory =
    Arc<dyn Fn(&ClientConfig) -> Result<Arc<dyn BrokerClient>, OsbError> + Send + Sync>;

type CacheEntry = (ClientConfig, Arc<dyn BrokerClient>);

/// Caches one [`BrokerClient`] per broker resource.
#[derive(Clone)]
pub struct BrokerClientManager {
    factory: ClientFactory,
    clients: Arc<RwLock<HashMap<ObjectKey, CacheEntry>>>,
}

impl Default for BrokerClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrokerClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("BrokerClientManager")
            .field("clients", &len)
            .finish_non_exhaustive()
    }
}

impl BrokerClientManager {
    /// Manager building [`HttpBrokerClient`]s.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(Arc::new(|config: &ClientConfig| {
            let client: Arc<dyn BrokerClient> = Arc::new(HttpBrokerClient::new(config)?);
            Ok(client)
        }))
    }

    /// Manager using a custom factory, e.g. one returning fakes in tests.
    #[must_use]
    pub fn with_factory(factory: ClientFactory) -> Self {
        Self {
            factory,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return the cached client for `broker`, building a new one if the config changed.
    ///
    /// # Errors
    ///
    /// Returns the factory's error; the cache is left untouched in that case.
    pub fn get_or_create(
        &self,
        broker: &ObjectKey,
        config: &ClientConfig,
    ) -> Result<Arc<dyn BrokerClient>, OsbError> {
        {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached, client)) = clients.get(broker) {
                if cached == config {
                    return Ok(Arc::clone(client));
                }
            }
        }

        debug!(broker = %broker, url = %config.url, "Building broker client");
        let client = (self.factory)(config)?;
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker.clone(), (config.clone(), Arc::clone(&client)));
        Ok(client)
    }

    /// Drop the cached client for a deleted broker.
    pub fn remove(&self, broker: &ObjectKey) {
        if self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(broker)
            .is_some()
        {
            debug!(broker = %broker, "Removed broker client");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
