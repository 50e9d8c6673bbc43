// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) for the service catalog.
//!
//! This module defines all Kubernetes Custom Resource Definitions used by svcat
//! to reconcile Open Service Broker backends declaratively.
//!
//! # Resource Types
//!
//! ## Brokers
//!
//! - [`ClusterServiceBroker`] - Cluster-scoped OSB endpoint
//! - [`ServiceBroker`] - Namespace-scoped OSB endpoint
//!
//! ## Catalog (written by the broker reconciler, never by users)
//!
//! - [`ClusterServiceClass`] / [`ServiceClass`] - Offerings from a broker catalog
//! - [`ClusterServicePlan`] / [`ServicePlan`] - Tiers of an offering
//!
//! ## Consumption
//!
//! - [`ServiceInstance`] - A provisioned occurrence of a class and plan
//! - [`ServiceBinding`] - Credentials for an instance, materialized into a Secret
//!
//! # Example: Requesting an Instance
//!
//! ```rust,no_run
//! use svcat::crd::{PlanReference, ServiceInstanceSpec};
//!
//! let reference = PlanReference::ClusterExternalName {
//!     class: "mysql".to_string(),
//!     plan: "small".to_string(),
//! };
//!
//! let spec = ServiceInstanceSpec {
//!     plan_reference: (&reference).into(),
//!     parameters: Some(serde_json::json!({"version": "8.0"})),
//!     ..ServiceInstanceSpec::default()
//! };
//! ```

pub mod binding;
pub mod broker;
pub mod catalog;
pub mod instance;
pub mod plan_reference;

pub use binding::*;
pub use broker::*;
pub use catalog::*;
pub use instance::*;
pub use plan_reference::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a catalog entity lives at cluster scope or inside a namespace.
///
/// Brokers of one scope only ever produce classes and plans of the same scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CatalogScope {
    Cluster,
    Namespaced,
}

/// Condition represents an observation of a resource's current state.
///
/// Conditions are used in status subresources to communicate the state of
/// a resource to users and controllers.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition: Ready, Failed or `OrphanMitigation`.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Reference to an object in the same namespace (or a cluster-scoped object) by name.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Reference to a namespaced object from a cluster-scoped one.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// A source of parameters for a provision, update or bind request.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// A key of a Secret in the namespace of the referencing object.
    /// The value must decode to a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Reference to one key of a Secret.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyReference {
    /// Name of the Secret.
    pub name: String,
    /// Key within the Secret data.
    pub key: String,
}

/// Identity of the user that last changed an instance or binding.
///
/// Forwarded to brokers in the originating-identity header.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
pub struct UserInfo {
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<BTreeMap<String, Vec<String>>>,
}

/// Schema for opaque JSON fields: any object, preserved verbatim by the API server.
pub(crate) fn raw_json_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
