// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Credential injection: binding results into Secrets.
//!
//! A successful bind yields a credentials object. The injector:
//!
//! 1. applies the binding's `secretTransforms` in order, each seeing the output of
//!    the previous one
//! 2. renders the result as Secret data, either one entry per credential or one
//!    JSON document under `secretKey`
//! 3. writes the Secret with a controller owner reference to the binding,
//!    replacing all existing data
//!
//! Ejecting deletes the Secret again, but only if this binding controls it.

use crate::constants::{API_GROUP_VERSION, KIND_SERVICE_BINDING};
use crate::crd::{AddKeyTransform, ServiceBinding, SecretTransform};
use crate::jsonpath::{evaluate_to_bytes, JsonPathError};
use crate::labels::{K8S_MANAGED_BY, K8S_PART_OF, MANAGED_BY_BINDING_CONTROLLER, PART_OF_SVCAT};
use crate::osb::JsonObject;
use crate::store::{ObjectKey, SharedStore, StoreError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ObjectMeta};
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Secret type written for binding credentials.
const SECRET_TYPE_OPAQUE: &str = "Opaque";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("secretTransforms[{index}]: {message}")]
    InvalidTransform { index: usize, message: String },

    #[error("secretTransforms[{index}]: {source}")]
    JsonPath {
        index: usize,
        #[source]
        source: JsonPathError,
    },

    #[error("secretTransforms[{index}]: secret {secret} does not exist")]
    SourceSecretNotFound { index: usize, secret: String },

    #[error("secret {secret} exists and is not controlled by ServiceBinding {binding}")]
    NotOwned { secret: String, binding: String },

    #[error("ServiceBinding {0} has no uid; cannot own a secret")]
    MissingUid(String),

    #[error("failed to serialize credentials: {0}")]
    Serialize(String),

    #[error("secret store error: {0}")]
    Store(StoreError),
}

impl InjectError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

/// One credential entry.
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialValue {
    /// A value as returned by the broker.
    Json(Value),
    /// Raw bytes, from `addKey.value` or another secret.
    Bytes(Vec<u8>),
}

impl CredentialValue {
    /// Secret data bytes: strings verbatim, other JSON encoded.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Json(Value::String(s)) => s.as_bytes().to_vec(),
            Self::Json(other) => other.to_string().into_bytes(),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

/// Credentials keyed by name.
pub type Credentials = BTreeMap<String, CredentialValue>;

/// Credentials from a broker response.
#[must_use]
pub fn credentials_from_json(object: &JsonObject) -> Credentials {
    object
        .iter()
        .map(|(k, v)| (k.clone(), CredentialValue::Json(v.clone())))
        .collect()
}

fn credentials_document(credentials: &Credentials) -> Value {
    Value::Object(
        credentials
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Render credentials as Secret data.
///
/// # Errors
///
/// Returns [`InjectError::Serialize`] if the credentials cannot be JSON encoded.
pub fn render_secret_data(
    credentials: &Credentials,
    secret_key: Option<&str>,
) -> Result<BTreeMap<String, ByteString>, InjectError> {
    match secret_key {
        Some(key) => {
            let document = serde_json::to_vec(&credentials_document(credentials))
                .map_err(|e| InjectError::Serialize(e.to_string()))?;
            Ok(BTreeMap::from([(key.to_string(), ByteString(document))]))
        }
        None => Ok(credentials
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.to_bytes())))
            .collect()),
    }
}

/// Owner reference making `binding` the controller of its secret.
///
/// # Errors
///
/// Returns [`InjectError::MissingUid`] for a binding that was never persisted.
pub fn build_owner_reference(binding: &ServiceBinding) -> Result<OwnerReference, InjectError> {
    let uid = binding
        .metadata
        .uid
        .clone()
        .ok_or_else(|| InjectError::MissingUid(ObjectKey::of(binding).to_string()))?;
    Ok(OwnerReference {
        api_version: API_GROUP_VERSION.to_string(),
        kind: KIND_SERVICE_BINDING.to_string(),
        name: binding.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn is_controlled_by(secret: &Secret, binding: &ServiceBinding) -> bool {
    let Some(uid) = binding.metadata.uid.as_deref() else {
        return false;
    };
    secret
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Writes and deletes binding secrets.
#[derive(Clone)]
pub struct CredentialInjector {
    secrets: SharedStore<Secret>,
}

impl CredentialInjector {
    #[must_use]
    pub fn new(secrets: SharedStore<Secret>) -> Self {
        Self { secrets }
    }

    /// Apply `transforms` in order. `namespace` is the default for `addKeysFrom`.
    ///
    /// # Errors
    ///
    /// Fails on a transform that sets no or several kinds, an invalid base64
    /// value, a JSONPath without match or a missing source secret.
    pub async fn transform(
        &self,
        namespace: &str,
        mut credentials: Credentials,
        transforms: &[SecretTransform],
    ) -> Result<Credentials, InjectError> {
        for (index, transform) in transforms.iter().enumerate() {
            let invalid = |message: &str| InjectError::InvalidTransform {
                index,
                message: message.to_string(),
            };
            match (
                &transform.rename_key,
                &transform.add_key,
                &transform.add_keys_from,
                &transform.remove_key,
            ) {
                (Some(rename), None, None, None) => {
                    if let Some(value) = credentials.remove(&rename.from) {
                        credentials.insert(rename.to.clone(), value);
                    }
                }
                (None, Some(add), None, None) => {
                    let value = add_key_value(index, add, &credentials)?;
                    credentials.insert(add.key.clone(), value);
                }
                (None, None, Some(from), None) => {
                    let reference = from
                        .secret_ref
                        .as_ref()
                        .ok_or_else(|| invalid("addKeysFrom requires secretRef"))?;
                    let key = ObjectKey::namespaced(
                        reference.namespace.as_deref().unwrap_or(namespace),
                        &reference.name,
                    );
                    let source = match self.secrets.get(&key).await {
                        Ok(secret) => secret,
                        Err(e) if e.is_not_found() => {
                            return Err(InjectError::SourceSecretNotFound {
                                index,
                                secret: key.to_string(),
                            })
                        }
                        Err(e) => return Err(InjectError::Store(e)),
                    };
                    for (k, v) in source.data.unwrap_or_default() {
                        credentials.insert(k, CredentialValue::Bytes(v.0));
                    }
                }
                (None, None, None, Some(remove)) => {
                    credentials.remove(&remove.key);
                }
                (None, None, None, None) => return Err(invalid("no transform specified")),
                _ => return Err(invalid("only one transform kind may be set per entry")),
            }
        }
        Ok(credentials)
    }

    /// Create or fully replace the binding's secret with `data`.
    ///
    /// # Errors
    ///
    /// Returns [`InjectError::NotOwned`] if a secret of that name exists and is not
    /// controlled by the binding; store errors otherwise.
    pub async fn inject(
        &self,
        binding: &ServiceBinding,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), InjectError> {
        let namespace = binding.namespace().unwrap_or_default();
        let key = ObjectKey::namespaced(&namespace, binding.secret_name());
        let owner = build_owner_reference(binding)?;

        let mut labels = BTreeMap::new();
        labels.insert(K8S_MANAGED_BY.to_string(), MANAGED_BY_BINDING_CONTROLLER.to_string());
        labels.insert(K8S_PART_OF.to_string(), PART_OF_SVCAT.to_string());

        match self.secrets.get(&key).await {
            Ok(mut existing) => {
                if !is_controlled_by(&existing, binding) {
                    return Err(InjectError::NotOwned {
                        secret: key.to_string(),
                        binding: ObjectKey::of(binding).to_string(),
                    });
                }
                existing.data = Some(data);
                existing.string_data = None;
                existing.labels_mut().extend(labels);
                self.secrets
                    .replace(&existing)
                    .await
                    .map_err(InjectError::Store)?;
                debug!(secret = %key, "Updated binding secret");
            }
            Err(e) if e.is_not_found() => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        namespace: Some(namespace.clone()),
                        labels: Some(labels),
                        owner_references: Some(vec![owner]),
                        ..ObjectMeta::default()
                    },
                    data: Some(data),
                    type_: Some(SECRET_TYPE_OPAQUE.to_string()),
                    ..Secret::default()
                };
                self.secrets
                    .create(&secret)
                    .await
                    .map_err(InjectError::Store)?;
                info!(secret = %key, "Created binding secret");
            }
            Err(e) => return Err(InjectError::Store(e)),
        }
        Ok(())
    }

    /// Delete the binding's secret. A missing secret, or one the binding does
    /// not control, is left alone.
    ///
    /// # Errors
    ///
    /// Returns store errors other than not-found.
    pub async fn eject(&self, binding: &ServiceBinding) -> Result<(), InjectError> {
        let namespace = binding.namespace().unwrap_or_default();
        let key = ObjectKey::namespaced(namespace, binding.secret_name());
        let secret = match self.secrets.get(&key).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(InjectError::Store(e)),
        };
        if !is_controlled_by(&secret, binding) {
            warn!(secret = %key, "Not deleting secret not controlled by binding");
            return Ok(());
        }
        match self.secrets.delete(&key, &DeleteParams::default()).await {
            Ok(()) => {
                info!(secret = %key, "Deleted binding secret");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(InjectError::Store(e)),
        }
    }
}

/// Value of an `addKey` transform. Precedence: JSONPath, string, bytes.
fn add_key_value(
    index: usize,
    add: &AddKeyTransform,
    credentials: &Credentials,
) -> Result<CredentialValue, InjectError> {
    if let Some(expression) = &add.json_path_expression {
        let bytes = evaluate_to_bytes(expression, &credentials_document(credentials))
            .map_err(|source| InjectError::JsonPath { index, source })?;
        return Ok(CredentialValue::Bytes(bytes));
    }
    if let Some(value) = &add.string_value {
        return Ok(CredentialValue::Json(Value::String(value.clone())));
    }
    if let Some(encoded) = &add.value {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| InjectError::InvalidTransform {
                index,
                message: format!("addKey.value is not valid base64: {e}"),
            })?;
        return Ok(CredentialValue::Bytes(bytes));
    }
    Err(InjectError::InvalidTransform {
        index,
        message: "addKey requires value, stringValue or jsonPathExpression".to_string(),
    })
}

#[cfg(test)]
#[path = "injector_tests.rs"]
mod injector_tests;
