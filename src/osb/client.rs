// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `reqwest` implementation of [`BrokerClient`].

use super::errors::OsbError;
use super::types::{
    BindRequest, BindRequestBody, BindResource, BindResponse, BindResponseBody, Catalog,
    DeprovisionRequest, DeprovisionResponse, ErrorBody, GetBindingRequest, GetBindingResponse,
    GetInstanceResponse, InstanceOperationResponse, InstanceOperationResponseBody,
    LastOperationRequest, LastOperationResponse, OriginatingIdentity, ProvisionRequest,
    ProvisionRequestBody, UnbindRequest, UnbindResponse, UpdateInstanceRequest,
    UpdateInstanceRequestBody,
};
use super::{AuthConfig, BrokerClient, ClientConfig};
use crate::constants::{
    OSB_API_VERSION_HEADER, OSB_ORIGINATING_IDENTITY_HEADER, OSB_POOL_MAX_IDLE_PER_HOST,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

const ACCEPTS_INCOMPLETE: &str = "accepts_incomplete";

/// Broker client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBrokerClient {
    name: String,
    base: Url,
    api_version: String,
    auth: Option<AuthConfig>,
    http: HttpClient,
}

/// Raw response: status and body bytes.
struct RawResponse {
    status: StatusCode,
    body: Vec<u8>,
}

impl HttpBrokerClient {
    /// Build a client from broker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OsbError::Config`] if the URL does not parse, the CA bundle is not
    /// valid PEM or the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, OsbError> {
        let base = Url::parse(&config.url)
            .map_err(|e| OsbError::Config(format!("invalid broker URL {:?}: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(OsbError::Config(format!(
                "broker URL {:?} cannot be used as a base",
                config.url
            )));
        }

        let mut builder = HttpClient::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(OSB_POOL_MAX_IDLE_PER_HOST);
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &config.ca_bundle {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| OsbError::Config(format!("invalid caBundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| OsbError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            base,
            api_version: config.api_version.clone(),
            auth: config.auth.clone(),
            http,
        })
    }

    /// Join path segments onto the broker URL and append query pairs.
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, OsbError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| OsbError::Config("broker URL cannot be a base".to_string()))?;
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        identity: Option<&OriginatingIdentity>,
    ) -> Result<RawResponse, OsbError> {
        debug!(broker = %self.name, method = %method, url = %url, "OSB request");

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(OSB_API_VERSION_HEADER, &self.api_version);
        request = match &self.auth {
            Some(AuthConfig::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(AuthConfig::Bearer { token }) => request.bearer_auth(token),
            None => request,
        };
        if let Some(identity) = identity {
            request = request.header(OSB_ORIGINATING_IDENTITY_HEADER, encode_identity(identity)?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(broker = %self.name, method = %method, url = %url, error = %e, "OSB request failed");
            OsbError::from(e)
        })?;
        let status = response.status();
        let body = response.bytes().await.map_err(OsbError::from)?.to_vec();
        debug!(broker = %self.name, method = %method, url = %url, status = %status, "OSB response");
        Ok(RawResponse { status, body })
    }

    fn accepts_incomplete(flag: bool) -> Vec<(&'static str, &'static str)> {
        if flag {
            vec![(ACCEPTS_INCOMPLETE, "true")]
        } else {
            Vec::new()
        }
    }
}

/// `kubernetes <base64(json)>`
fn encode_identity(identity: &OriginatingIdentity) -> Result<String, OsbError> {
    let json = serde_json::to_vec(&identity.value)
        .map_err(|e| OsbError::InvalidRequest(format!("originating identity: {e}")))?;
    Ok(format!("{} {}", identity.platform, BASE64.encode(json)))
}

fn http_error(response: &RawResponse) -> OsbError {
    let parsed: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
    OsbError::Http {
        status: response.status.as_u16(),
        error: parsed.error,
        description: parsed.description,
    }
}

fn decode<T: DeserializeOwned>(response: &RawResponse) -> Result<T, OsbError> {
    serde_json::from_slice(&response.body).map_err(|e| OsbError::Decode {
        status: response.status.as_u16(),
        message: e.to_string(),
    })
}

/// Like [`decode`], but an empty body yields the default value.
fn decode_or_default<T: DeserializeOwned + Default>(response: &RawResponse) -> Result<T, OsbError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode(response)
}

fn require(field: &str, value: &str) -> Result<(), OsbError> {
    if value.is_empty() {
        return Err(OsbError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}

fn instance_operation(
    response: &RawResponse,
    sync_codes: &[StatusCode],
) -> Result<InstanceOperationResponse, OsbError> {
    if sync_codes.contains(&response.status) {
        let body: InstanceOperationResponseBody = decode_or_default(response)?;
        return Ok(InstanceOperationResponse {
            is_async: false,
            dashboard_url: body.dashboard_url,
            operation_key: None,
        });
    }
    if response.status == StatusCode::ACCEPTED {
        let body: InstanceOperationResponseBody = decode_or_default(response)?;
        return Ok(InstanceOperationResponse {
            is_async: true,
            dashboard_url: body.dashboard_url,
            operation_key: body.operation,
        });
    }
    Err(http_error(response))
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn get_catalog(&self) -> Result<Catalog, OsbError> {
        let url = self.endpoint(&["v2", "catalog"], &[])?;
        let response = self.send::<()>(Method::GET, url, None, None).await?;
        if response.status == StatusCode::OK {
            decode(&response)
        } else {
            Err(http_error(&response))
        }
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<InstanceOperationResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        require("service_id", &request.service_id)?;
        require("plan_id", &request.plan_id)?;

        let query = Self::accepts_incomplete(request.accepts_incomplete);
        let url = self.endpoint(&["v2", "service_instances", &request.instance_id], &query)?;
        let body = ProvisionRequestBody {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            organization_guid: &request.organization_guid,
            space_guid: &request.space_guid,
            parameters: request.parameters.as_ref(),
            context: request.context.as_ref(),
        };
        let response = self
            .send(Method::PUT, url, Some(&body), request.originating_identity.as_ref())
            .await?;
        instance_operation(&response, &[StatusCode::OK, StatusCode::CREATED])
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<InstanceOperationResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        require("service_id", &request.service_id)?;

        let query = Self::accepts_incomplete(request.accepts_incomplete);
        let url = self.endpoint(&["v2", "service_instances", &request.instance_id], &query)?;
        let body = UpdateInstanceRequestBody {
            service_id: &request.service_id,
            plan_id: request.plan_id.as_deref(),
            parameters: request.parameters.as_ref(),
            previous_values: request.previous_values.as_ref(),
            context: request.context.as_ref(),
        };
        let response = self
            .send(Method::PATCH, url, Some(&body), request.originating_identity.as_ref())
            .await?;
        instance_operation(&response, &[StatusCode::OK])
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        require("service_id", &request.service_id)?;
        require("plan_id", &request.plan_id)?;

        let mut query = vec![
            ("service_id", request.service_id.as_str()),
            ("plan_id", request.plan_id.as_str()),
        ];
        query.extend(Self::accepts_incomplete(request.accepts_incomplete));
        let url = self.endpoint(&["v2", "service_instances", &request.instance_id], &query)?;
        let response = self
            .send::<()>(Method::DELETE, url, None, request.originating_identity.as_ref())
            .await?;
        match response.status {
            StatusCode::OK | StatusCode::GONE => Ok(DeprovisionResponse::default()),
            StatusCode::ACCEPTED => {
                let body: InstanceOperationResponseBody = decode_or_default(&response)?;
                Ok(DeprovisionResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(&response)),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<GetInstanceResponse, OsbError> {
        require("instance_id", instance_id)?;
        let url = self.endpoint(&["v2", "service_instances", instance_id], &[])?;
        let response = self.send::<()>(Method::GET, url, None, None).await?;
        if response.status == StatusCode::OK {
            decode(&response)
        } else {
            Err(http_error(&response))
        }
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        let query = last_operation_query(request);
        let url = self.endpoint(
            &["v2", "service_instances", &request.instance_id, "last_operation"],
            &query,
        )?;
        let response = self
            .send::<()>(Method::GET, url, None, request.originating_identity.as_ref())
            .await?;
        if response.status == StatusCode::OK {
            decode(&response)
        } else {
            Err(http_error(&response))
        }
    }

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        let binding_id = request
            .binding_id
            .as_deref()
            .ok_or_else(|| OsbError::InvalidRequest("binding_id is required".to_string()))?;
        let query = last_operation_query(request);
        let url = self.endpoint(
            &[
                "v2",
                "service_instances",
                &request.instance_id,
                "service_bindings",
                binding_id,
                "last_operation",
            ],
            &query,
        )?;
        let response = self
            .send::<()>(Method::GET, url, None, request.originating_identity.as_ref())
            .await?;
        if response.status == StatusCode::OK {
            decode(&response)
        } else {
            Err(http_error(&response))
        }
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        require("binding_id", &request.binding_id)?;
        require("instance_id", &request.instance_id)?;
        require("service_id", &request.service_id)?;
        require("plan_id", &request.plan_id)?;

        let query = Self::accepts_incomplete(request.accepts_incomplete);
        let url = self.endpoint(
            &[
                "v2",
                "service_instances",
                &request.instance_id,
                "service_bindings",
                &request.binding_id,
            ],
            &query,
        )?;
        let body = BindRequestBody {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            app_guid: request.app_guid.as_deref(),
            bind_resource: request
                .app_guid
                .as_deref()
                .map(|app_guid| BindResource { app_guid }),
            parameters: request.parameters.as_ref(),
            context: request.context.as_ref(),
        };
        let response = self
            .send(Method::PUT, url, Some(&body), request.originating_identity.as_ref())
            .await?;
        match response.status {
            StatusCode::OK | StatusCode::CREATED => {
                let body: BindResponseBody = decode(&response)?;
                Ok(BindResponse {
                    is_async: false,
                    credentials: body.credentials,
                    operation_key: None,
                })
            }
            StatusCode::ACCEPTED => {
                let body: BindResponseBody = decode_or_default(&response)?;
                Ok(BindResponse {
                    is_async: true,
                    credentials: None,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(&response)),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        require("binding_id", &request.binding_id)?;
        require("instance_id", &request.instance_id)?;
        require("service_id", &request.service_id)?;
        require("plan_id", &request.plan_id)?;

        let mut query = vec![
            ("service_id", request.service_id.as_str()),
            ("plan_id", request.plan_id.as_str()),
        ];
        query.extend(Self::accepts_incomplete(request.accepts_incomplete));
        let url = self.endpoint(
            &[
                "v2",
                "service_instances",
                &request.instance_id,
                "service_bindings",
                &request.binding_id,
            ],
            &query,
        )?;
        let response = self
            .send::<()>(Method::DELETE, url, None, request.originating_identity.as_ref())
            .await?;
        match response.status {
            StatusCode::OK | StatusCode::GONE => Ok(UnbindResponse::default()),
            StatusCode::ACCEPTED => {
                let body: BindResponseBody = decode_or_default(&response)?;
                Ok(UnbindResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(&response)),
        }
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, OsbError> {
        require("instance_id", &request.instance_id)?;
        require("binding_id", &request.binding_id)?;
        let url = self.endpoint(
            &[
                "v2",
                "service_instances",
                &request.instance_id,
                "service_bindings",
                &request.binding_id,
            ],
            &[],
        )?;
        let response = self.send::<()>(Method::GET, url, None, None).await?;
        if response.status == StatusCode::OK {
            decode(&response)
        } else {
            Err(http_error(&response))
        }
    }
}

fn last_operation_query(request: &LastOperationRequest) -> Vec<(&str, &str)> {
    let mut query = Vec::new();
    if let Some(operation) = &request.operation_key {
        query.push(("operation", operation.as_str()));
    }
    if let Some(service_id) = &request.service_id {
        query.push(("service_id", service_id.as_str()));
    }
    if let Some(plan_id) = &request.plan_id {
        query.push(("plan_id", plan_id.as_str()));
    }
    query
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;
