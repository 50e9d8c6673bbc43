// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Catalog entities: service classes and plans in both scopes.
//!
//! These objects are owned by their broker. Users read them and reference them
//! from instances; only the broker reconciler creates, updates or deletes them.

use super::{raw_json_schema, CatalogScope, LocalObjectReference};
use crate::labels::{
    LABEL_CLUSTER_SERVICE_BROKER_NAME, LABEL_CLUSTER_SERVICE_CLASS_REF_NAME,
    LABEL_SERVICE_BROKER_NAME, LABEL_SERVICE_CLASS_REF_NAME,
};
use crate::store::Stored;
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fields shared by [`ClusterServiceClass`] and [`ServiceClass`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceClassSpec {
    /// Name of the service as the broker advertises it.
    pub external_name: String,

    /// Broker-assigned identifier, unique per broker.
    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    /// Whether instances of this class can be bound by default.
    #[serde(default)]
    pub bindable: bool,

    /// Whether the broker supports `GET` on bindings.
    #[serde(default)]
    pub binding_retrievable: bool,

    /// Whether the broker supports `GET` on instances.
    #[serde(default)]
    pub instances_retrievable: bool,

    /// Whether an instance may switch plans.
    #[serde(default)]
    pub plan_updatable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub external_metadata: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Parameters merged beneath plan defaults and instance parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub default_provision_parameters: Option<serde_json::Value>,
}

/// Status shared by both class scopes.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassStatus {
    /// The broker no longer advertises this class, but instances still reference it.
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

/// Fields shared by [`ClusterServicePlan`] and [`ServicePlan`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonServicePlanSpec {
    pub external_name: String,

    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    /// Overrides the class `bindable` flag when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,

    #[serde(default)]
    pub free: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub external_metadata: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub service_binding_create_parameter_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub default_provision_parameters: Option<serde_json::Value>,
}

/// Status shared by both plan scopes.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanStatus {
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

// ============================================================================
// Classes
// ============================================================================

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceClass",
    shortname = "csc",
    doc = "ClusterServiceClass is a service offering from a ClusterServiceBroker catalog.",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.clusterServiceBrokerName"}"#,
    printcolumn = r#"{"name":"Bindable","type":"boolean","jsonPath":".spec.bindable"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceClassStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceClassSpec {
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,

    pub cluster_service_broker_name: String,
}

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    namespaced,
    shortname = "sc",
    doc = "ServiceClass is a service offering from a namespaced ServiceBroker catalog.",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.serviceBrokerName"}"#,
    printcolumn = r#"{"name":"Bindable","type":"boolean","jsonPath":".spec.bindable"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceClassStatus")]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,

    pub service_broker_name: String,
}

// ============================================================================
// Plans
// ============================================================================

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServicePlan",
    shortname = "csp",
    doc = "ClusterServicePlan is a tier of a ClusterServiceClass.",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.clusterServiceBrokerName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.clusterServiceClassRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServicePlanStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterServicePlanSpec {
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,

    pub cluster_service_broker_name: String,

    pub cluster_service_class_ref: LocalObjectReference,
}

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServicePlan",
    namespaced,
    shortname = "sp",
    doc = "ServicePlan is a tier of a namespaced ServiceClass.",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.serviceBrokerName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.serviceClassRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServicePlanStatus")]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,

    pub service_broker_name: String,

    pub service_class_ref: LocalObjectReference,
}

// ============================================================================
// Scope-generic access
// ============================================================================

/// Common view over both class kinds.
pub trait ClassResource: Stored {
    const SCOPE: CatalogScope;

    /// Filter property naming the owning broker.
    const BROKER_NAME_PROPERTY: &'static str;

    /// Label carrying the hashed owning broker name.
    const BROKER_NAME_LABEL: &'static str;

    /// Build a new class for a broker; `metadata` carries name, namespace and labels.
    fn from_catalog(metadata: ObjectMeta, broker_name: &str, spec: CommonServiceClassSpec) -> Self;

    fn common_spec(&self) -> &CommonServiceClassSpec;

    fn common_spec_mut(&mut self) -> &mut CommonServiceClassSpec;

    fn broker_name(&self) -> &str;

    fn removed_from_broker_catalog(&self) -> bool;

    fn set_removed_from_broker_catalog(&mut self, removed: bool);
}

/// Common view over both plan kinds.
pub trait PlanResource: Stored {
    const SCOPE: CatalogScope;

    const BROKER_NAME_PROPERTY: &'static str;

    /// Filter property naming the parent class.
    const CLASS_NAME_PROPERTY: &'static str;

    const BROKER_NAME_LABEL: &'static str;

    /// Label carrying the hashed parent class name.
    const CLASS_NAME_LABEL: &'static str;

    fn from_catalog(
        metadata: ObjectMeta,
        broker_name: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self;

    fn common_spec(&self) -> &CommonServicePlanSpec;

    fn common_spec_mut(&mut self) -> &mut CommonServicePlanSpec;

    fn broker_name(&self) -> &str;

    fn class_name(&self) -> &str;

    fn removed_from_broker_catalog(&self) -> bool;

    fn set_removed_from_broker_catalog(&mut self, removed: bool);
}

impl ClassResource for ClusterServiceClass {
    const SCOPE: CatalogScope = CatalogScope::Cluster;
    const BROKER_NAME_PROPERTY: &'static str = "spec.clusterServiceBrokerName";
    const BROKER_NAME_LABEL: &'static str = LABEL_CLUSTER_SERVICE_BROKER_NAME;

    fn from_catalog(metadata: ObjectMeta, broker_name: &str, spec: CommonServiceClassSpec) -> Self {
        Self {
            metadata,
            spec: ClusterServiceClassSpec {
                common: spec,
                cluster_service_broker_name: broker_name.to_string(),
            },
            status: Some(ServiceClassStatus::default()),
        }
    }

    fn common_spec(&self) -> &CommonServiceClassSpec {
        &self.spec.common
    }

    fn common_spec_mut(&mut self) -> &mut CommonServiceClassSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.cluster_service_broker_name
    }

    fn removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    fn set_removed_from_broker_catalog(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(ServiceClassStatus::default)
            .removed_from_broker_catalog = removed;
    }
}

impl ClassResource for ServiceClass {
    const SCOPE: CatalogScope = CatalogScope::Namespaced;
    const BROKER_NAME_PROPERTY: &'static str = "spec.serviceBrokerName";
    const BROKER_NAME_LABEL: &'static str = LABEL_SERVICE_BROKER_NAME;

    fn from_catalog(metadata: ObjectMeta, broker_name: &str, spec: CommonServiceClassSpec) -> Self {
        Self {
            metadata,
            spec: ServiceClassSpec {
                common: spec,
                service_broker_name: broker_name.to_string(),
            },
            status: Some(ServiceClassStatus::default()),
        }
    }

    fn common_spec(&self) -> &CommonServiceClassSpec {
        &self.spec.common
    }

    fn common_spec_mut(&mut self) -> &mut CommonServiceClassSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.service_broker_name
    }

    fn removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    fn set_removed_from_broker_catalog(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(ServiceClassStatus::default)
            .removed_from_broker_catalog = removed;
    }
}

impl PlanResource for ClusterServicePlan {
    const SCOPE: CatalogScope = CatalogScope::Cluster;
    const BROKER_NAME_PROPERTY: &'static str = "spec.clusterServiceBrokerName";
    const CLASS_NAME_PROPERTY: &'static str = "spec.clusterServiceClass.name";
    const BROKER_NAME_LABEL: &'static str = LABEL_CLUSTER_SERVICE_BROKER_NAME;
    const CLASS_NAME_LABEL: &'static str = LABEL_CLUSTER_SERVICE_CLASS_REF_NAME;

    fn from_catalog(
        metadata: ObjectMeta,
        broker_name: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self {
        Self {
            metadata,
            spec: ClusterServicePlanSpec {
                common: spec,
                cluster_service_broker_name: broker_name.to_string(),
                cluster_service_class_ref: LocalObjectReference {
                    name: class_name.to_string(),
                },
            },
            status: Some(ServicePlanStatus::default()),
        }
    }

    fn common_spec(&self) -> &CommonServicePlanSpec {
        &self.spec.common
    }

    fn common_spec_mut(&mut self) -> &mut CommonServicePlanSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.cluster_service_broker_name
    }

    fn class_name(&self) -> &str {
        &self.spec.cluster_service_class_ref.name
    }

    fn removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    fn set_removed_from_broker_catalog(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(ServicePlanStatus::default)
            .removed_from_broker_catalog = removed;
    }
}

impl PlanResource for ServicePlan {
    const SCOPE: CatalogScope = CatalogScope::Namespaced;
    const BROKER_NAME_PROPERTY: &'static str = "spec.serviceBrokerName";
    const CLASS_NAME_PROPERTY: &'static str = "spec.serviceClassRef.name";
    const BROKER_NAME_LABEL: &'static str = LABEL_SERVICE_BROKER_NAME;
    const CLASS_NAME_LABEL: &'static str = LABEL_SERVICE_CLASS_REF_NAME;

    fn from_catalog(
        metadata: ObjectMeta,
        broker_name: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self {
        Self {
            metadata,
            spec: ServicePlanSpec {
                common: spec,
                service_broker_name: broker_name.to_string(),
                service_class_ref: LocalObjectReference {
                    name: class_name.to_string(),
                },
            },
            status: Some(ServicePlanStatus::default()),
        }
    }

    fn common_spec(&self) -> &CommonServicePlanSpec {
        &self.spec.common
    }

    fn common_spec_mut(&mut self) -> &mut CommonServicePlanSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.service_broker_name
    }

    fn class_name(&self) -> &str {
        &self.spec.service_class_ref.name
    }

    fn removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    fn set_removed_from_broker_catalog(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(ServicePlanStatus::default)
            .removed_from_broker_catalog = removed;
    }
}

/// Whether a plan can be bound, honouring the plan override of the class flag.
#[must_use]
pub fn plan_is_bindable(class: &CommonServiceClassSpec, plan: &CommonServicePlanSpec) -> bool {
    plan.bindable.unwrap_or(class.bindable)
}
