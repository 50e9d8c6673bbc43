// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common label, annotation and finalizer constants used across all reconcilers.
//!
//! Catalog entities created by the broker reconciler carry hashed copies of their
//! identifying spec fields as labels, so they can be listed with label selectors
//! even when the raw values exceed the 63 character label value limit.

use sha2::{Digest, Sha224};

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the name of a higher-level application this one is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

// ============================================================================
// Kubernetes Standard Label Values
// ============================================================================

/// Value for `app.kubernetes.io/part-of` on everything the catalog creates
pub const PART_OF_SVCAT: &str = "service-catalog";

/// Value for `app.kubernetes.io/managed-by` on classes and plans written by a broker reconciler
pub const MANAGED_BY_BROKER_CONTROLLER: &str = "svcat-broker-controller";

/// Value for `app.kubernetes.io/managed-by` on binding secrets
pub const MANAGED_BY_BINDING_CONTROLLER: &str = "svcat-binding-controller";

// ============================================================================
// Catalog Labels (values are SHA-224 hex digests of the field)
// ============================================================================

/// Label carrying the hashed `spec.externalID` of a class or plan
pub const LABEL_EXTERNAL_ID: &str = "servicecatalog.k8s.io/spec.externalID";

/// Label carrying the hashed `spec.externalName` of a class or plan
pub const LABEL_EXTERNAL_NAME: &str = "servicecatalog.k8s.io/spec.externalName";

/// Label carrying the hashed owning `ClusterServiceBroker` name
pub const LABEL_CLUSTER_SERVICE_BROKER_NAME: &str =
    "servicecatalog.k8s.io/spec.clusterServiceBrokerName";

/// Label carrying the hashed owning `ServiceBroker` name
pub const LABEL_SERVICE_BROKER_NAME: &str = "servicecatalog.k8s.io/spec.serviceBrokerName";

/// Label carrying the hashed parent `ClusterServiceClass` name of a plan
pub const LABEL_CLUSTER_SERVICE_CLASS_REF_NAME: &str =
    "servicecatalog.k8s.io/spec.clusterServiceClassRef.name";

/// Label carrying the hashed parent `ServiceClass` name of a plan
pub const LABEL_SERVICE_CLASS_REF_NAME: &str = "servicecatalog.k8s.io/spec.serviceClassRef.name";

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer placed on brokers, instances and bindings
pub const FINALIZER_SERVICE_CATALOG: &str = "kubernetes-incubator/service-catalog";

/// Hash a spec field value into a label-safe string.
///
/// SHA-224 hex output is 56 characters, inside the label value limit.
#[must_use]
pub fn hashed_label_value(value: &str) -> String {
    let digest = Sha224::digest(value.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
