// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Standard Kubernetes status condition reasons for service catalog resources.
//!
//! Reasons are programmatic identifiers in CamelCase that explain why a condition has
//! a particular status. They form a closed set: every condition the reconcilers write
//! uses one of the constants below.
//!
//! # Condition Types
//!
//! - `Ready` - the resource matches its spec on the broker side
//! - `Failed` - a terminal error; nothing is retried until the spec changes
//! - `OrphanMitigation` - the engine is deprovisioning something the broker may have
//!   created after an ambiguous failure
//!
//! # Example Status
//!
//! ```yaml
//! status:
//!   conditions:
//!     - type: Ready
//!       status: "False"
//!       reason: ProvisionCallFailed
//!       message: "Provision call failed: Status: 400; ErrorMessage: <nil>; Description: bad plan"
//!     - type: Failed
//!       status: "True"
//!       reason: ProvisionCallFailed
//!       message: "Provision call failed: Status: 400; ErrorMessage: <nil>; Description: bad plan"
//!   lastConditionState: ProvisionCallFailed
//! ```

// ============================================================================
// Condition Types
// ============================================================================

/// Encompassing readiness condition carried by every resource.
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Terminal failure condition.
pub const CONDITION_TYPE_FAILED: &str = "Failed";

/// Set while orphan mitigation is running for an instance or binding.
pub const CONDITION_TYPE_ORPHAN_MITIGATION: &str = "OrphanMitigation";

/// Condition status values.
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// ============================================================================
// Common Reasons
// ============================================================================

/// Reading or writing the entity store failed.
pub const REASON_STORE_ERROR: &str = "StoreError";

/// Parameters could not be built (collision, missing secret, non-object value).
pub const REASON_PARAMETERS_ERROR: &str = "ParametersError";

/// An operation did not succeed within the reconciliation retry duration.
pub const REASON_RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

/// Polling `last_operation` returned a non-retryable error.
pub const REASON_POLL_LAST_OPERATION_ERROR: &str = "ErrorPollingLastOperation";

/// The broker answered with a 401 or 403, or its auth secret is unusable.
pub const REASON_AUTH_FAILED: &str = "AuthFailed";

/// The object references a broker that does not exist.
pub const REASON_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";

// ============================================================================
// Broker Reasons
// ============================================================================

/// Catalog fetched and classes and plans are in sync.
pub const REASON_FETCHED_CATALOG: &str = "FetchedCatalog";

/// `GET /v2/catalog` failed.
pub const REASON_CATALOG_FETCH_FAILED: &str = "CatalogFetchFailed";

/// The catalog returned by the broker is malformed.
pub const REASON_INVALID_CATALOG: &str = "InvalidCatalog";

/// A catalog restriction expression does not compile.
pub const REASON_INVALID_CATALOG_RESTRICTIONS: &str = "ErrorInvalidCatalogRestrictions";

/// `relistDuration` is not a positive duration.
pub const REASON_INVALID_RELIST_DURATION: &str = "ErrorInvalidRelistDuration";

/// Writing classes or plans to the store failed.
pub const REASON_CATALOG_SYNC_FAILED: &str = "ErrorSyncingCatalog";

/// Broker deletion waits for instances that still use its plans.
pub const REASON_CATALOG_IN_USE: &str = "CatalogInUse";

// ============================================================================
// Instance Reasons
// ============================================================================

/// Provision succeeded (synchronously or after polling).
pub const REASON_PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";

/// Asynchronous provision in progress.
pub const REASON_PROVISIONING: &str = "Provisioning";

/// Provision failed on the broker.
pub const REASON_PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";

/// Update succeeded.
pub const REASON_INSTANCE_UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";

/// Asynchronous update in progress.
pub const REASON_UPDATING_INSTANCE: &str = "UpdatingInstance";

/// Update failed on the broker.
pub const REASON_UPDATE_INSTANCE_CALL_FAILED: &str = "UpdateInstanceCallFailed";

/// Deprovision succeeded.
pub const REASON_DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";

/// Asynchronous deprovision in progress.
pub const REASON_DEPROVISIONING: &str = "Deprovisioning";

/// Deprovision failed on the broker.
pub const REASON_DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";

/// Deprovision waits until every binding to the instance is gone.
pub const REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS: &str =
    "DeprovisionBlockedByExistingCredentials";

/// Orphan mitigation started after an ambiguous provision failure.
pub const REASON_STARTING_ORPHAN_MITIGATION: &str = "StartingInstanceOrphanMitigation";

/// Orphan mitigation gave up.
pub const REASON_ORPHAN_MITIGATION_FAILED: &str = "OrphanMitigationFailed";

/// The plan reference is missing, ambiguous or incomplete.
pub const REASON_INVALID_PLAN_REFERENCE: &str = "ErrorInvalidPlanReference";

/// No class matches the instance's class reference.
pub const REASON_NONEXISTENT_CLASS: &str = "ReferencesNonexistentServiceClass";

/// No plan of the class matches the instance's plan reference.
pub const REASON_PLAN_NOT_FOUND: &str = "PlanNotFound";

/// The plan changed but the class does not allow plan updates.
pub const REASON_PLAN_NOT_UPDATABLE: &str = "ErrorPlanNotUpdatable";

/// New instances may not use a plan the broker no longer offers.
pub const REASON_REMOVED_FROM_CATALOG: &str = "ServicePlanRemovedFromBrokerCatalog";

// ============================================================================
// Binding Reasons
// ============================================================================

/// Credentials written to the output secret.
pub const REASON_INJECTED_BIND_RESULT: &str = "InjectedBindResult";

/// Asynchronous bind in progress.
pub const REASON_BINDING: &str = "Binding";

/// Bind failed on the broker.
pub const REASON_BIND_CALL_FAILED: &str = "BindCallFailed";

/// A bind ended ambiguously; the broker may hold credentials to remove.
pub const REASON_STARTING_BINDING_ORPHAN_MITIGATION: &str = "StartingBindingOrphanMitigation";

/// Writing the output secret failed or a transform could not be applied.
pub const REASON_INJECTION_FAILED: &str = "ErrorInjectingBindResult";

/// Unbind succeeded.
pub const REASON_UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";

/// Asynchronous unbind in progress.
pub const REASON_UNBINDING: &str = "Unbinding";

/// Unbind failed on the broker.
pub const REASON_UNBIND_CALL_FAILED: &str = "UnbindCallFailed";

/// The referenced instance is being deleted.
pub const REASON_INSTANCE_BEING_DELETED: &str = "InstanceBeingDeleted";

/// The referenced instance is not ready yet.
pub const REASON_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";

/// The referenced instance does not exist.
pub const REASON_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";

/// The instance's class and plan do not allow bindings.
pub const REASON_NON_BINDABLE: &str = "ErrorNonbindableServiceClass";

/// Unbind waits for an operation on the instance to finish.
pub const REASON_INSTANCE_OPERATION_IN_PROGRESS: &str = "ErrorAsyncOperationInProgress";

#[cfg(test)]
#[path = "status_reasons_tests.rs"]
mod status_reasons_tests;
