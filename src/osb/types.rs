// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Open Service Broker wire types.
//!
//! Request structs carry both path/query inputs (instance ID, operation token) and
//! the JSON body. Only the fields marked for serialization in the `*Body` structs
//! go on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object used for parameters and credentials.
pub type JsonObject = Map<String, Value>;

// ============================================================================
// Catalog
// ============================================================================

/// Response of `GET /v2/catalog`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<Service>,
}

/// A service offering as advertised by a broker.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub instances_retrievable: bool,
    #[serde(default)]
    pub bindings_retrievable: bool,
    /// OSB spells this `plan_updateable`.
    #[serde(default, rename = "plan_updateable")]
    pub plan_updatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// A tier of a service.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absent means free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Schemas>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Schemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<ServiceInstanceSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<ServiceBindingSchema>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstanceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<InputParametersSchema>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceBindingSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InputParametersSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Plan {
    /// Schema for instance create parameters, if the broker declared one.
    #[must_use]
    pub fn instance_create_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_instance
            .as_ref()?
            .create
            .as_ref()?
            .parameters
            .as_ref()
    }

    #[must_use]
    pub fn instance_update_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_instance
            .as_ref()?
            .update
            .as_ref()?
            .parameters
            .as_ref()
    }

    #[must_use]
    pub fn binding_create_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_binding
            .as_ref()?
            .create
            .as_ref()?
            .parameters
            .as_ref()
    }
}

// ============================================================================
// Request metadata
// ============================================================================

/// Kubernetes context profile sent with provision, update and bind.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub platform: String,
    pub namespace: String,
    pub clusterid: String,
    pub instance_name: String,
}

/// Caller identity forwarded in `X-Broker-API-Originating-Identity`.
#[derive(Clone, Debug, PartialEq)]
pub struct OriginatingIdentity {
    /// Platform name, `kubernetes`.
    pub platform: String,
    /// JSON document describing the user.
    pub value: Value,
}

/// Token identifying an asynchronous operation.
pub type OperationKey = String;

// ============================================================================
// Instances
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<JsonObject>,
    pub context: Option<RequestContext>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Serialize)]
pub(crate) struct ProvisionRequestBody<'a> {
    pub service_id: &'a str,
    pub plan_id: &'a str,
    pub organization_guid: &'a str,
    pub space_guid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<&'a JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a RequestContext>,
}

/// Result of a provision or update call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceOperationResponse {
    /// The broker answered 202.
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<OperationKey>,
}

#[derive(Deserialize, Default)]
pub(crate) struct InstanceOperationResponseBody {
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

/// Values the broker knew before an update.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct PreviousValues {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_id: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateInstanceRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    /// Only set when the plan changes.
    pub plan_id: Option<String>,
    /// Only set when the parameters change.
    pub parameters: Option<JsonObject>,
    pub previous_values: Option<PreviousValues>,
    pub context: Option<RequestContext>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Serialize)]
pub(crate) struct UpdateInstanceRequestBody<'a> {
    pub service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<&'a JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<&'a PreviousValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a RequestContext>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<OperationKey>,
}

/// Response of `GET /v2/service_instances/{id}`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct GetInstanceResponse {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub parameters: Option<JsonObject>,
}

// ============================================================================
// Last operation
// ============================================================================

/// State reported by a `last_operation` endpoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    /// Set for binding operations only.
    pub binding_id: Option<String>,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<OperationKey>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default)]
    pub description: Option<String>,
}

// ============================================================================
// Bindings
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    /// Deprecated but still sent; the namespace of the binding.
    pub app_guid: Option<String>,
    pub parameters: Option<JsonObject>,
    pub context: Option<RequestContext>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Serialize)]
pub(crate) struct BindResource<'a> {
    pub app_guid: &'a str,
}

#[derive(Serialize)]
pub(crate) struct BindRequestBody<'a> {
    pub service_id: &'a str,
    pub plan_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<BindResource<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<&'a JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a RequestContext>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindResponse {
    pub is_async: bool,
    pub credentials: Option<JsonObject>,
    pub operation_key: Option<OperationKey>,
}

#[derive(Deserialize, Default)]
pub(crate) struct BindResponseBody {
    #[serde(default)]
    pub credentials: Option<JsonObject>,
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnbindResponse {
    pub is_async: bool,
    pub operation_key: Option<OperationKey>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

/// Response of `GET .../service_bindings/{bid}`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct GetBindingResponse {
    #[serde(default)]
    pub credentials: Option<JsonObject>,
    #[serde(default)]
    pub parameters: Option<JsonObject>,
}

/// Broker error body, `{"error": "...", "description": "..."}`.
#[derive(Deserialize, Default)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
