// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the svcat operator.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for all service catalog CRDs
pub const API_GROUP: &str = "servicecatalog.k8s.io";

/// API version for all service catalog CRDs
pub const API_VERSION: &str = "v1beta1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "servicecatalog.k8s.io/v1beta1";

/// Kind name for `ClusterServiceBroker` resource
pub const KIND_CLUSTER_SERVICE_BROKER: &str = "ClusterServiceBroker";

/// Kind name for `ServiceBroker` resource
pub const KIND_SERVICE_BROKER: &str = "ServiceBroker";

/// Kind name for `ServiceInstance` resource
pub const KIND_SERVICE_INSTANCE: &str = "ServiceInstance";

/// Kind name for `ServiceBinding` resource
pub const KIND_SERVICE_BINDING: &str = "ServiceBinding";

// ============================================================================
// Open Service Broker Protocol Constants
// ============================================================================

/// Header carrying the OSB API version on every broker request
pub const OSB_API_VERSION_HEADER: &str = "X-Broker-API-Version";

/// Header carrying the identity of the user that caused the request
pub const OSB_ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

/// Default OSB API version sent to brokers
pub const DEFAULT_OSB_API_VERSION: &str = "2.13";

/// Platform name sent in originating-identity headers and request contexts
pub const OSB_PLATFORM_KUBERNETES: &str = "kubernetes";

/// Default per-call OSB request timeout (seconds)
pub const DEFAULT_OSB_TIMEOUT_SECS: u64 = 15;

/// Maximum idle connections kept per broker host
pub const OSB_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// OSB error code returned with 422 when the broker is already busy with the entity
pub const OSB_ERROR_CONCURRENCY: &str = "ConcurrencyError";

/// OSB error code returned with 422 when the broker needs `accepts_incomplete=true`
pub const OSB_ERROR_ASYNC_REQUIRED: &str = "AsyncRequired";

// ============================================================================
// Secret Key Constants
// ============================================================================

/// Key holding the username in a basic-auth broker secret
pub const AUTH_SECRET_USERNAME_KEY: &str = "username";

/// Key holding the password in a basic-auth broker secret
pub const AUTH_SECRET_PASSWORD_KEY: &str = "password";

/// Key holding the token in a bearer-auth broker secret
pub const AUTH_SECRET_TOKEN_KEY: &str = "token";

/// Placeholder stored in status for parameter values sourced from secrets
pub const REDACTED_PARAMETER_VALUE: &str = "<redacted>";

// ============================================================================
// Poller Constants
// ============================================================================

/// First `last_operation` poll delay (seconds)
pub const DEFAULT_POLL_INITIAL_SECS: u64 = 1;

/// Cap on the `last_operation` poll delay (seconds, one hour)
pub const DEFAULT_POLL_MAX_SECS: u64 = 3600;

/// Jitter applied to poll delays (±10%)
pub const POLL_RANDOMIZATION_FACTOR: f64 = 0.1;

// ============================================================================
// Work Queue Constants
// ============================================================================

/// Default number of concurrent reconcilers per kind
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Initial per-key failure backoff (milliseconds)
pub const QUEUE_BASE_DELAY_MILLIS: u64 = 100;

/// Maximum per-key failure backoff (seconds, ten minutes)
pub const QUEUE_MAX_DELAY_SECS: u64 = 600;

/// End-to-end timeout for a single reconcile pass (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Reconciler Constants
// ============================================================================

/// Default number of orphan-mitigation deprovision attempts before giving up
pub const DEFAULT_ORPHAN_MITIGATION_ATTEMPTS: u32 = 7;

/// Initial delay between orphan-mitigation attempts (seconds)
pub const ORPHAN_MITIGATION_INITIAL_DELAY_SECS: u64 = 1;

/// Maximum delay between orphan-mitigation attempts (seconds)
pub const ORPHAN_MITIGATION_MAX_DELAY_SECS: u64 = 300;

/// Default window for an operation to succeed before it is abandoned (seconds, one week)
pub const DEFAULT_RECONCILIATION_RETRY_DURATION_SECS: u64 = 604_800;

/// Default relist interval for brokers in `Duration` mode (seconds)
pub const DEFAULT_RELIST_DURATION_SECS: u64 = 900;

/// Requeue interval while waiting on a collaborator (seconds)
pub const REQUEUE_WHEN_WAITING_SECS: u64 = 30;

// ============================================================================
// Server Constants
// ============================================================================

/// Default admission webhook listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8443";

/// Default metrics server port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Path serving Prometheus metrics
pub const METRICS_PATH: &str = "/metrics";

/// Path of the liveness endpoint served next to metrics
pub const HEALTHZ_PATH: &str = "/healthz";

/// Path serving the binding admission review
pub const ADMISSION_PATH: &str = "/validate-servicebinding";

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default lease name
pub const DEFAULT_LEASE_NAME: &str = "svcat-controller-manager";

/// Default lease duration (seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default lease renew grace period (seconds)
pub const DEFAULT_LEASE_GRACE_SECS: u64 = 2;

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of Tokio worker threads
pub const TOKIO_WORKER_THREADS: usize = 4;
