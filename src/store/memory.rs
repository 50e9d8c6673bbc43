// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-process [`EntityStore`] with API-server semantics.
//!
//! - `resourceVersion` is a store-wide counter bumped on every write
//! - `metadata.generation` is bumped when anything outside metadata and status changes
//! - `replace` and `patch` never touch status, `replace_status` touches nothing else
//! - deleting an object with finalizers only sets `deletionTimestamp`; the object goes
//!   away once the last finalizer is removed
//! - watchers receive every change through a broadcast channel

use super::{EntityStore, ObjectKey, StoreError, StorePatch, WatchEvent};
use crate::filter::Selector;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::DeleteParams;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Capacity of the watch broadcast; slower watchers see a lag error and resync.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    resource_version: u64,
}

impl<K> State<K> {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory store for one kind.
pub struct MemoryStore<K: Clone> {
    state: Mutex<State<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: Clone> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone> MemoryStore<K> {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                resource_version: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn to_value<T: Serialize>(obj: &T) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

/// Everything except `metadata` and `status`.
fn content_of(value: &Value) -> Value {
    let mut content = value.clone();
    if let Some(map) = content.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    content
}

/// Apply an RFC 7386 merge patch in place.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Some(target_map) = target.as_object_mut() {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn random_uid() -> String {
    let raw: u128 = rand::random();
    let hex = format!("{raw:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Clone + Serialize + DeserializeOwned,
{
    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: Self::kind(),
            key: key.to_string(),
        }
    }

    fn conflict(key: &ObjectKey, expected: &str, actual: &str) -> StoreError {
        StoreError::Conflict {
            kind: Self::kind(),
            key: key.to_string(),
            message: format!("resourceVersion {expected} is stale, current is {actual}"),
        }
    }

    fn check_version(key: &ObjectKey, stored: &K, incoming: Option<&String>) -> Result<(), StoreError> {
        let current = stored.meta().resource_version.clone().unwrap_or_default();
        match incoming {
            Some(version) if !version.is_empty() && *version != current => {
                Err(Self::conflict(key, version, &current))
            }
            _ => Ok(()),
        }
    }

    /// Store `next` as the new state of `key`, finishing a pending deletion when
    /// the last finalizer is gone.
    fn commit(&self, state: &mut State<K>, key: ObjectKey, mut next: K) -> K {
        next.meta_mut().resource_version = Some(state.next_version());
        if next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty() {
            state.objects.remove(&key);
            self.publish(WatchEvent::Deleted(next.clone()));
        } else {
            state.objects.insert(key, next.clone());
            self.publish(WatchEvent::Modified(next.clone()));
        }
        next
    }

    /// Carry server-owned metadata over from the stored object.
    fn preserve_server_fields(stored: &K, next: &mut K, content_changed: bool) {
        let generation = stored.meta().generation.unwrap_or(1);
        let meta = next.meta_mut();
        meta.uid.clone_from(&stored.meta().uid);
        meta.creation_timestamp.clone_from(&stored.meta().creation_timestamp);
        meta.deletion_timestamp.clone_from(&stored.meta().deletion_timestamp);
        meta.generation = Some(if content_changed {
            generation + 1
        } else {
            generation
        });
    }
}

#[async_trait]
impl<K> EntityStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()>
        + ResourceExt
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        let selector = label_selector
            .map(Selector::parse)
            .transpose()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let state = self.lock();
        Ok(state
            .objects
            .values()
            .filter(|obj| namespace.is_none() || obj.meta().namespace.as_deref() == namespace)
            .filter(|obj| selector.as_ref().is_none_or(|s| s.matches(obj.labels())))
            .cloned()
            .collect())
    }

    fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>> {
        let namespace = namespace.map(str::to_string);
        let receiver = self.events.subscribe();
        futures::stream::unfold((receiver, namespace), |(mut receiver, namespace)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if namespace.is_none() || event.object().meta().namespace == namespace {
                            return Some((Ok(event), (receiver, namespace)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let err = StoreError::Transient(format!("watch fell behind by {missed} events"));
                        return Some((Err(err), (receiver, namespace)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        if key.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".to_string()));
        }
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: Self::kind(),
                key: key.to_string(),
            });
        }
        let mut created = obj.clone();
        let version = state.next_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(random_uid());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Timestamp::now()));
        meta.deletion_timestamp = None;
        state.objects.insert(key, created.clone());
        drop(state);
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let mut state = self.lock();
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(&key, &stored, obj.meta().resource_version.as_ref())?;

        let stored_value = to_value(&stored)?;
        let mut next_value = to_value(obj)?;
        if let Some(map) = next_value.as_object_mut() {
            match stored_value.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        let changed = content_of(&stored_value) != content_of(&next_value);
        let mut next: K = from_value(next_value)?;
        Self::preserve_server_fields(&stored, &mut next, changed);
        Ok(self.commit(&mut state, key, next))
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let mut state = self.lock();
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(&key, &stored, obj.meta().resource_version.as_ref())?;

        let mut next_value = to_value(&stored)?;
        let incoming = to_value(obj)?;
        if let Some(map) = next_value.as_object_mut() {
            match incoming.get("status") {
                Some(status) if !status.is_null() => {
                    map.insert("status".to_string(), status.clone());
                }
                _ => {
                    map.remove("status");
                }
            }
        }
        let next: K = from_value(next_value)?;
        Ok(self.commit(&mut state, key, next))
    }

    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<K, StoreError> {
        let body = match patch {
            StorePatch::Merge(body) | StorePatch::Strategic(body) => body,
        };
        let mut state = self.lock();
        let stored = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))?;
        let requested_version = body
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::check_version(key, &stored, requested_version.as_ref())?;

        let stored_value = to_value(&stored)?;
        let mut next_value = stored_value.clone();
        merge_patch(&mut next_value, body);
        if let Some(map) = next_value.as_object_mut() {
            // status is a subresource wherever a spec exists
            if stored_value.get("spec").is_some() {
                match stored_value.get("status") {
                    Some(status) => {
                        map.insert("status".to_string(), status.clone());
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }
        }
        let changed = content_of(&stored_value) != content_of(&next_value);
        let mut next: K = from_value(next_value)?;
        Self::preserve_server_fields(&stored, &mut next, changed);
        Ok(self.commit(&mut state, key.clone(), next))
    }

    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))?;
        if let Some(preconditions) = &params.preconditions {
            Self::check_version(key, &stored, preconditions.resource_version.as_ref())?;
        }

        if stored.finalizers().is_empty() {
            state.objects.remove(key);
            drop(state);
            self.publish(WatchEvent::Deleted(stored));
        } else if stored.meta().deletion_timestamp.is_none() {
            let mut next = stored;
            next.meta_mut().deletion_timestamp = Some(Time(Timestamp::now()));
            self.commit(&mut state, key.clone(), next);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
