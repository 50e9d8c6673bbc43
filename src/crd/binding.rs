// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! [`ServiceBinding`]: credentials for an instance, written into a Secret.

use super::{raw_json_schema, Condition, LocalObjectReference, ParametersFromSource, UserInfo};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `ServiceBinding` asks a broker for credentials to an instance.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    namespaced,
    shortname = "bnd",
    doc = "ServiceBinding requests credentials for a ServiceInstance and stores them in a Secret.",
    printcolumn = r#"{"name":"Service-Instance","type":"string","jsonPath":".spec.instanceRef.name"}"#,
    printcolumn = r#"{"name":"Secret-Name","type":"string","jsonPath":".spec.secretName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ServiceBindingStatus")]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace.
    pub instance_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Output secret name; defaults to the binding name.
    #[serde(default)]
    pub secret_name: String,

    /// When set, all credentials are stored as one JSON document under this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Transforms applied in order to the broker credentials.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transforms: Vec<SecretTransform>,

    /// Binding ID sent to the broker. Generated when empty. Immutable once set.
    #[serde(rename = "externalID", default)]
    pub external_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// One credential transform; exactly one field must be set.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_key: Option<RenameKeyTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_key: Option<AddKeyTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_keys_from: Option<AddKeysFromTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_key: Option<RemoveKeyTransform>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

/// Adds a key. Precedence: `jsonPathExpression`, then `stringValue`, then `value`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,

    /// Base64 encoded bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    /// kubectl-style JSONPath evaluated against the credentials, e.g. `{.uri}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path_expression: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<super::ObjectReference>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct RemoveKeyTransform {
    pub key: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceBindingOperation {
    Bind,
    Unbind,
}

/// Whether the broker may hold credentials for this binding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub enum UnbindStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingPropertiesState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_json_schema")]
    pub parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub async_op_in_progress: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<ServiceBindingOperation>,

    #[serde(default)]
    pub reconciled_generation: i64,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<ServiceBindingPropertiesState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<ServiceBindingPropertiesState>,

    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    #[serde(default)]
    pub orphan_mitigation_attempts: u32,

    #[serde(default)]
    pub unbind_status: UnbindStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_condition_state: Option<String>,
}

impl ServiceBinding {
    /// Output secret name, falling back to the binding name.
    #[must_use]
    pub fn secret_name(&self) -> String {
        if self.spec.secret_name.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.secret_name.clone()
        }
    }

    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
