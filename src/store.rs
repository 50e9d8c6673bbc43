// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Entity store gateway.
//!
//! Reconcilers never talk to the API server directly. They go through
//! [`EntityStore`], which offers get, list, watch, create, replace, patch and delete
//! with optimistic concurrency on `metadata.resourceVersion`. Two implementations
//! exist:
//!
//! - [`KubeStore`] - backed by `kube::Api`
//! - [`MemoryStore`] - an in-process store with the same semantics, used by tests
//!
//! Conflicts are returned to the caller, never retried here.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DeleteParams;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of a stored object: optional namespace plus name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object.
    #[must_use]
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A change observed on a watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }
}

/// Patch body and its merge strategy.
#[derive(Clone, Debug, PartialEq)]
pub enum StorePatch {
    /// RFC 7386 JSON merge patch.
    Merge(serde_json::Value),
    /// Kubernetes strategic merge patch (built-in kinds only on a real API server).
    Strategic(serde_json::Value),
}

/// Errors surfaced by an [`EntityStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} was modified concurrently: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    /// Network errors, timeouts, 429 and 5xx from the API server.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Transient(_))
    }

    /// Classify a `kube::Error` for the object `key` of `kind`.
    #[must_use]
    pub fn from_kube(err: kube::Error, kind: &str, key: &ObjectKey) -> Self {
        match err {
            kube::Error::Api(api_err) => match api_err.code {
                404 => Self::NotFound {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 if api_err.reason == "AlreadyExists" => Self::AlreadyExists {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 => Self::Conflict {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    message: api_err.message.clone(),
                },
                403 => Self::Forbidden(api_err.message.clone()),
                400 | 422 => Self::Invalid(api_err.message.clone()),
                _ => Self::Transient(api_err.message.clone()),
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Watchable object store with optimistic concurrency.
///
/// Writers must send back the `resourceVersion` they read; a stale version
/// yields [`StoreError::Conflict`].
#[async_trait]
pub trait EntityStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// List objects, optionally restricted to a namespace and a label selector
    /// (`key=value`, `key in (a,b)`, ... comma separated).
    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError>;

    /// Stream of changes. The stream relists on its own after a gap; consumers
    /// treat an `Err` item as a hint to resync.
    fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace everything except status.
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace only the status subresource.
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;

    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<K, StoreError>;

    /// Delete; objects with finalizers only get a deletion timestamp.
    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<(), StoreError>;
}

/// Shared handle to a store for one kind.
pub type SharedStore<K> = Arc<dyn EntityStore<K>>;

/// One store per kind the engine reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub cluster_service_brokers: SharedStore<ClusterServiceBroker>,
    pub service_brokers: SharedStore<ServiceBroker>,
    pub cluster_service_classes: SharedStore<ClusterServiceClass>,
    pub service_classes: SharedStore<ServiceClass>,
    pub cluster_service_plans: SharedStore<ClusterServicePlan>,
    pub service_plans: SharedStore<ServicePlan>,
    pub service_instances: SharedStore<ServiceInstance>,
    pub service_bindings: SharedStore<ServiceBinding>,
    pub secrets: SharedStore<Secret>,
}

impl Stores {
    /// Stores backed by the Kubernetes API.
    #[must_use]
    pub fn kubernetes(client: &Client) -> Self {
        Self {
            cluster_service_brokers: Arc::new(KubeStore::cluster(client.clone())),
            service_brokers: Arc::new(KubeStore::namespaced(client.clone())),
            cluster_service_classes: Arc::new(KubeStore::cluster(client.clone())),
            service_classes: Arc::new(KubeStore::namespaced(client.clone())),
            cluster_service_plans: Arc::new(KubeStore::cluster(client.clone())),
            service_plans: Arc::new(KubeStore::namespaced(client.clone())),
            service_instances: Arc::new(KubeStore::namespaced(client.clone())),
            service_bindings: Arc::new(KubeStore::namespaced(client.clone())),
            secrets: Arc::new(KubeStore::namespaced(client.clone())),
        }
    }

    /// Fresh, empty in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            cluster_service_brokers: Arc::new(MemoryStore::new()),
            service_brokers: Arc::new(MemoryStore::new()),
            cluster_service_classes: Arc::new(MemoryStore::new()),
            service_classes: Arc::new(MemoryStore::new()),
            cluster_service_plans: Arc::new(MemoryStore::new()),
            service_plans: Arc::new(MemoryStore::new()),
            service_instances: Arc::new(MemoryStore::new()),
            service_bindings: Arc::new(MemoryStore::new()),
            secrets: Arc::new(MemoryStore::new()),
        }
    }
}

/// A kind that has a store in [`Stores`].
pub trait Stored:
    Resource<DynamicType = ()>
    + ResourceExt
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn store(stores: &Stores) -> &SharedStore<Self>;
}

macro_rules! impl_stored {
    ($($kind:ty => $field:ident),* $(,)?) => {
        $(
            impl Stored for $kind {
                fn store(stores: &Stores) -> &SharedStore<Self> {
                    &stores.$field
                }
            }
        )*
    };
}

impl_stored! {
    ClusterServiceBroker => cluster_service_brokers,
    ServiceBroker => service_brokers,
    ClusterServiceClass => cluster_service_classes,
    ServiceClass => service_classes,
    ClusterServicePlan => cluster_service_plans,
    ServicePlan => service_plans,
    ServiceInstance => service_instances,
    ServiceBinding => service_bindings,
    Secret => secrets,
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
