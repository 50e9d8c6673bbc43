// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Broker resources: cluster-scoped [`ClusterServiceBroker`] and namespaced [`ServiceBroker`].

use super::{CatalogScope, Condition, LocalObjectReference, ObjectReference};
use crate::crd::catalog::{
    ClusterServiceClass, ClusterServicePlan, ClassResource, PlanResource, ServiceClass, ServicePlan,
};
use crate::store::{ObjectKey, Stored};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How often a broker's catalog is fetched.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub enum RelistBehavior {
    /// Relist every `relistDuration`, plus on spec change.
    #[default]
    Duration,
    /// Relist only on spec change, which includes bumping `relistRequests`.
    Manual,
}

/// Restrictions applied to a broker catalog before entities are created.
///
/// Each list entry is a selector expression such as `spec.externalName in (mysql,redis)`.
/// Entries within a list are ANDed; the two lists apply independently.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRestrictions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_class: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_plan: Vec<String>,
}

/// Fields shared by both broker scopes.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceBrokerSpec {
    /// Base URL of the broker, e.g. `https://broker.example.com/`.
    pub url: String,

    /// Skip verification of the broker's TLS certificate.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Base64 encoded PEM bundle used to verify the broker's certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Relist trigger policy.
    #[serde(default)]
    pub relist_behavior: RelistBehavior,

    /// Relist interval as a Go duration string (e.g. `15m`). Only used in `Duration` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relist_duration: Option<String>,

    /// Increment to force a relist.
    #[serde(default)]
    pub relist_requests: i64,

    /// Restrictions on which classes and plans are admitted from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_restrictions: Option<CatalogRestrictions>,
}

/// Status shared by both broker scopes.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation whose catalog was last fetched successfully.
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Generation last processed, regardless of outcome.
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<String>,

    /// RFC3339 time of the last successful catalog fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<String>,

    /// Reason of the Ready condition, for printer columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_condition_state: Option<String>,
}

// ============================================================================
// ClusterServiceBroker
// ============================================================================

/// Basic auth for a cluster-scoped broker; the secret holds `username` and `password`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBasicAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ObjectReference>,
}

/// Bearer auth for a cluster-scoped broker; the secret holds `token`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBearerTokenAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ObjectReference>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct ClusterServiceBrokerAuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<ClusterBasicAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<ClusterBearerTokenAuthConfig>,
}

/// `ClusterServiceBroker` exposes an OSB endpoint to every namespace.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceBroker",
    shortname = "csb",
    doc = "ClusterServiceBroker represents an Open Service Broker endpoint whose catalog is published cluster-wide.",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceBrokerStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonServiceBrokerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<ClusterServiceBrokerAuthInfo>,
}

// ============================================================================
// ServiceBroker
// ============================================================================

/// Basic auth for a namespaced broker; the secret lives in the broker's namespace.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Bearer auth for a namespaced broker.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BearerTokenAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct ServiceBrokerAuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerTokenAuthConfig>,
}

/// `ServiceBroker` exposes an OSB endpoint to a single namespace.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    namespaced,
    shortname = "sb",
    doc = "ServiceBroker represents an Open Service Broker endpoint whose catalog is published in its own namespace.",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceBrokerStatus")]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonServiceBrokerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<ServiceBrokerAuthInfo>,
}

// ============================================================================
// Scope-generic access
// ============================================================================

/// Which authentication scheme a broker secret carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerAuthKind {
    Basic,
    Bearer,
}

/// Resolved location of a broker's credentials secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAuthRef {
    pub kind: BrokerAuthKind,
    pub secret: ObjectKey,
}

/// Common view over both broker kinds, used by the generic broker reconciler.
pub trait BrokerResource: Stored {
    /// Class kind produced by this broker's catalog.
    type Class: ClassResource;
    /// Plan kind produced by this broker's catalog.
    type Plan: PlanResource;

    const SCOPE: CatalogScope;

    fn common_spec(&self) -> &CommonServiceBrokerSpec;

    fn broker_status(&self) -> Option<&ServiceBrokerStatus>;

    fn broker_status_mut(&mut self) -> &mut ServiceBrokerStatus;

    /// Credentials secret, if auth is configured.
    ///
    /// Returns `Err` with a message when auth is configured without a secret reference.
    fn auth_secret(&self) -> Result<Option<BrokerAuthRef>, String>;
}

impl BrokerResource for ClusterServiceBroker {
    type Class = ClusterServiceClass;
    type Plan = ClusterServicePlan;

    const SCOPE: CatalogScope = CatalogScope::Cluster;

    fn common_spec(&self) -> &CommonServiceBrokerSpec {
        &self.spec.common
    }

    fn broker_status(&self) -> Option<&ServiceBrokerStatus> {
        self.status.as_ref()
    }

    fn broker_status_mut(&mut self) -> &mut ServiceBrokerStatus {
        self.status.get_or_insert_with(ServiceBrokerStatus::default)
    }

    fn auth_secret(&self) -> Result<Option<BrokerAuthRef>, String> {
        let Some(auth) = &self.spec.auth_info else {
            return Ok(None);
        };
        let (kind, secret_ref) = match (&auth.basic, &auth.bearer) {
            (Some(basic), None) => (BrokerAuthKind::Basic, basic.secret_ref.as_ref()),
            (None, Some(bearer)) => (BrokerAuthKind::Bearer, bearer.secret_ref.as_ref()),
            (None, None) => return Ok(None),
            (Some(_), Some(_)) => {
                return Err("authInfo must specify only one of basic or bearer".to_string())
            }
        };
        let secret_ref = secret_ref.ok_or_else(|| "authInfo is missing secretRef".to_string())?;
        let namespace = secret_ref
            .namespace
            .clone()
            .ok_or_else(|| "authInfo secretRef of a cluster broker needs a namespace".to_string())?;
        Ok(Some(BrokerAuthRef {
            kind,
            secret: ObjectKey::namespaced(namespace, &secret_ref.name),
        }))
    }
}

impl BrokerResource for ServiceBroker {
    type Class = ServiceClass;
    type Plan = ServicePlan;

    const SCOPE: CatalogScope = CatalogScope::Namespaced;

    fn common_spec(&self) -> &CommonServiceBrokerSpec {
        &self.spec.common
    }

    fn broker_status(&self) -> Option<&ServiceBrokerStatus> {
        self.status.as_ref()
    }

    fn broker_status_mut(&mut self) -> &mut ServiceBrokerStatus {
        self.status.get_or_insert_with(ServiceBrokerStatus::default)
    }

    fn auth_secret(&self) -> Result<Option<BrokerAuthRef>, String> {
        let Some(auth) = &self.spec.auth_info else {
            return Ok(None);
        };
        let (kind, secret_ref) = match (&auth.basic, &auth.bearer) {
            (Some(basic), None) => (BrokerAuthKind::Basic, basic.secret_ref.as_ref()),
            (None, Some(bearer)) => (BrokerAuthKind::Bearer, bearer.secret_ref.as_ref()),
            (None, None) => return Ok(None),
            (Some(_), Some(_)) => {
                return Err("authInfo must specify only one of basic or bearer".to_string())
            }
        };
        let secret_ref = secret_ref.ok_or_else(|| "authInfo is missing secretRef".to_string())?;
        Ok(Some(BrokerAuthRef {
            kind,
            secret: ObjectKey::namespaced(self.namespace().unwrap_or_default(), &secret_ref.name),
        }))
    }
}
