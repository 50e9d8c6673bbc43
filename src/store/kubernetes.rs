// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! [`EntityStore`] backed by the Kubernetes API server.

use super::{EntityStore, ObjectKey, StoreError, StorePatch, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tracing::debug;

/// Store for one kind, talking to the API server through `kube::Api`.
pub struct KubeStore<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
{
    Api::all(client)
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    #[must_use]
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: namespaced_api::<K>,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
{
    #[must_use]
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: cluster_api::<K>,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }
}

#[async_trait]
impl<K> EntityStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + ResourceExt
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.api(key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), key))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let key = ObjectKey {
            namespace: namespace.map(str::to_string),
            name: "*".to_string(),
        };
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), &key))?;
        Ok(list.items)
    }

    fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>> {
        let kind = Self::kind();
        watcher(self.api(namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(watcher::Event::InitApply(obj)) => Some(Ok(WatchEvent::Added(obj))),
                        Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Modified(obj))),
                        Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                        Ok(watcher::Event::Init | watcher::Event::InitDone) => {
                            debug!("{} watch (re)listing", kind);
                            None
                        }
                        Err(e) => Some(Err(StoreError::Transient(format!("{kind} watch: {e}")))),
                    }
                }
            })
            .boxed()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), &key))
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), &key))
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let value =
            serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        // resourceVersion in the body makes the merge patch conditional
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        self.api(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), &key))
    }

    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<K, StoreError> {
        let api = self.api(key.namespace.as_deref());
        let params = PatchParams::default();
        let result = match patch {
            StorePatch::Merge(body) => api.patch(&key.name, &params, &Patch::Merge(body)).await,
            StorePatch::Strategic(body) => {
                api.patch(&key.name, &params, &Patch::Strategic(body)).await
            }
        };
        result.map_err(|e| StoreError::from_kube(e, &Self::kind(), key))
    }

    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<(), StoreError> {
        self.api(key.namespace.as_deref())
            .delete(&key.name, params)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), key))
    }
}
