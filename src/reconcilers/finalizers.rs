// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Generic finalizer management over an [`EntityStore`](crate::store::EntityStore).
//!
//! Brokers, instances and bindings carry [`FINALIZER_SERVICE_CATALOG`] until their
//! reconciler has undone every external side effect. Both helpers write the whole
//! object with the `resourceVersion` it was read at, so a concurrent change comes
//! back as a conflict instead of being overwritten.
//!
//! # Example
//!
//! ```rust,ignore
//! use svcat::labels::FINALIZER_SERVICE_CATALOG;
//! use svcat::reconcilers::finalizers::{ensure_finalizer, remove_finalizer};
//!
//! let instance = ensure_finalizer(&stores.service_instances, &instance, FINALIZER_SERVICE_CATALOG).await?;
//! if instance.is_being_deleted() {
//!     // deprovision...
//!     remove_finalizer(&stores.service_instances, &instance, FINALIZER_SERVICE_CATALOG).await?;
//! }
//! ```
//!
//! [`FINALIZER_SERVICE_CATALOG`]: crate::labels::FINALIZER_SERVICE_CATALOG

use crate::store::{ObjectKey, SharedStore, StoreError, Stored};
use kube::{Resource, ResourceExt};
use tracing::info;

/// Whether `resource` carries `finalizer`.
#[must_use]
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|existing| existing == finalizer))
}

/// Add `finalizer` unless present; returns the object as stored.
///
/// Objects already being deleted are returned unchanged: the API server refuses
/// new finalizers on them.
///
/// # Errors
///
/// Propagates store errors, including conflicts.
pub async fn ensure_finalizer<T: Stored>(
    store: &SharedStore<T>,
    resource: &T,
    finalizer: &str,
) -> Result<T, StoreError> {
    if has_finalizer(resource, finalizer) || resource.meta().deletion_timestamp.is_some() {
        return Ok(resource.clone());
    }
    let key = ObjectKey::of(resource);
    info!("Adding finalizer {} to {} {}", finalizer, T::kind(&()), key);

    let mut updated = resource.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    store.replace(&updated).await
}

/// Remove `finalizer` if present; returns the object as last written.
///
/// Removing the last finalizer of an object being deleted lets the store
/// delete it.
///
/// # Errors
///
/// Propagates store errors, including conflicts.
pub async fn remove_finalizer<T: Stored>(
    store: &SharedStore<T>,
    resource: &T,
    finalizer: &str,
) -> Result<T, StoreError> {
    if !has_finalizer(resource, finalizer) {
        return Ok(resource.clone());
    }
    let key = ObjectKey::of(resource);
    info!("Removing finalizer {} from {} {}", finalizer, T::kind(&()), key);

    let mut updated = resource.clone();
    updated.finalizers_mut().retain(|f| f != finalizer);
    store.replace(&updated).await
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
