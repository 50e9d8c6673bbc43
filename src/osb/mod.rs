// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Open Service Broker client.
//!
//! This module speaks the OSB v2 wire protocol to brokers:
//!
//! - Catalog discovery (`GET /v2/catalog`)
//! - Provision, update, deprovision and fetch of service instances
//! - Bind, unbind and fetch of service bindings
//! - `last_operation` polling for instances and bindings
//!
//! # Architecture
//!
//! [`BrokerClient`] is the seam reconcilers program against. [`HttpBrokerClient`]
//! implements it over `reqwest`; one is built per broker from a [`ClientConfig`]
//! and cached by [`BrokerClientManager`]. Clients never retry: retry, backoff and
//! orphan mitigation belong to the reconcilers.
//!
//! # Example
//!
//! ```rust,no_run
//! use svcat::osb::{BrokerClient, ClientConfig, HttpBrokerClient};
//!
//! # async fn example() -> Result<(), svcat::osb::OsbError> {
//! let config = ClientConfig::new("broker-a", "http://broker.example.svc/");
//! let client = HttpBrokerClient::new(&config)?;
//! let catalog = client.get_catalog().await?;
//! println!("{} services", catalog.services.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod errors;
pub mod manager;
pub mod types;

pub use client::HttpBrokerClient;
pub use errors::OsbError;
pub use manager::BrokerClientManager;
pub use types::*;

use crate::constants::{DEFAULT_OSB_API_VERSION, DEFAULT_OSB_TIMEOUT_SECS};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Credentials presented to a broker.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
        }
    }
}

/// Everything needed to build a client for one broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Broker name, used in logs.
    pub name: String,
    pub url: String,
    pub api_version: String,
    pub insecure_skip_tls_verify: bool,
    /// PEM encoded CA certificate(s).
    pub ca_bundle: Option<Vec<u8>>,
    pub auth: Option<AuthConfig>,
    pub timeout: Duration,
}

impl ClientConfig {
    /// Config with default API version and timeout and no auth.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_version: DEFAULT_OSB_API_VERSION.to_string(),
            insecure_skip_tls_verify: false,
            ca_bundle: None,
            auth: None,
            timeout: Duration::from_secs(DEFAULT_OSB_TIMEOUT_SECS),
        }
    }
}

/// Operations offered by an OSB broker.
///
/// Implementations are stateless and safe to share between tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch the broker catalog.
    async fn get_catalog(&self) -> Result<Catalog, OsbError>;

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<InstanceOperationResponse, OsbError>;

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<InstanceOperationResponse, OsbError>;

    /// Delete an instance. A 410 from the broker is reported as a synchronous success.
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError>;

    /// Fetch an instance (only for services with `instances_retrievable`).
    async fn get_instance(&self, instance_id: &str) -> Result<GetInstanceResponse, OsbError>;

    /// Poll the last operation on an instance.
    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;

    /// Poll the last operation on a binding; `request.binding_id` must be set.
    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError>;

    /// Delete a binding. A 410 from the broker is reported as a synchronous success.
    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError>;

    /// Fetch a binding (only for services with `bindings_retrievable`).
    async fn get_binding(&self, request: &GetBindingRequest)
        -> Result<GetBindingResponse, OsbError>;
}
