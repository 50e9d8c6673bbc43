// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! [`ServiceInstance`]: a provisioned occurrence of a class and plan.

use super::{
    raw_json_schema, Condition, LocalObjectReference, ParametersFromSource, PlanReferenceFields,
    UserInfo,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `ServiceInstance` requests a service from a broker.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    namespaced,
    shortname = "inst",
    doc = "ServiceInstance is a provisioned instance of a service class and plan.",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".status.userSpecifiedClassName"}"#,
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".status.userSpecifiedPlanName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceInstanceStatus")]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// User-facing class and plan addressing. Immutable.
    #[serde(flatten)]
    pub plan_reference: PlanReferenceFields,

    /// Resolved cluster class, written once by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_ref: Option<LocalObjectReference>,

    /// Resolved cluster plan, written by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_ref: Option<LocalObjectReference>,

    /// Inline provision parameters (a JSON object).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Instance ID sent to the broker. Generated when empty. Immutable once set.
    #[serde(rename = "externalID", default)]
    pub external_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,

    /// Increment to force an update call with unchanged parameters.
    #[serde(default)]
    pub update_requests: i64,
}

/// Operation currently being driven against the broker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceInstanceOperation {
    Provision,
    Update,
    Deprovision,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub enum ServiceInstanceProvisionStatus {
    #[default]
    NotProvisioned,
    Provisioned,
}

/// Whether the broker may hold resources for this instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub enum DeprovisionStatus {
    /// No request has ever reached the broker.
    #[default]
    NotRequired,
    /// The broker may hold resources; a deprovision must precede deletion.
    Required,
    Succeeded,
    Failed,
}

/// Snapshot of what was (or is being) sent to the broker.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstancePropertiesState {
    #[serde(rename = "classExternalID", default)]
    pub class_external_id: String,

    #[serde(default)]
    pub plan_external_name: String,

    #[serde(rename = "planExternalID", default)]
    pub plan_external_id: String,

    /// Merged parameters with secret-sourced values redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub parameters: Option<serde_json::Value>,

    /// SHA-256 of the canonical merged parameters, including secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub async_op_in_progress: bool,

    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    /// Deprovision attempts made by the current orphan mitigation.
    #[serde(default)]
    pub orphan_mitigation_attempts: u32,

    /// Opaque operation token returned by the broker with a 202.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    #[serde(rename = "dashboardURL", default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<ServiceInstanceOperation>,

    /// Generation whose operation last completed against the broker.
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Generation last processed, regardless of outcome.
    #[serde(default)]
    pub observed_generation: i64,

    /// `updateRequests` value last sent to the broker.
    #[serde(default)]
    pub observed_update_requests: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<ServiceInstancePropertiesState>,

    /// What the broker believes about this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<ServiceInstancePropertiesState>,

    #[serde(default)]
    pub provision_status: ServiceInstanceProvisionStatus,

    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub default_provision_parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_condition_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_specified_plan_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_specified_class_name: Option<String>,
}

impl ServiceInstance {
    /// Resolved class name, in whichever scope the reference used.
    #[must_use]
    pub fn resolved_class_name(&self) -> Option<&str> {
        self.spec
            .cluster_service_class_ref
            .as_ref()
            .or(self.spec.service_class_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    #[must_use]
    pub fn resolved_plan_name(&self) -> Option<&str> {
        self.spec
            .cluster_service_plan_ref
            .as_ref()
            .or(self.spec.service_plan_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
