// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Request parameter assembly for provision, update and bind.
//!
//! Parameters come from three layers. From lowest to highest precedence:
//!
//! 1. class `defaultProvisionParameters`
//! 2. plan `defaultProvisionParameters`
//! 3. the entity's own parameters: inline `spec.parameters` plus every
//!    `spec.parametersFrom` source
//!
//! Within layer 3 the sources must not overlap. Two sources defining the same
//! top-level key is an error, never a silent overwrite.
//!
//! The result carries three views: the full object sent to the broker, a copy
//! where every secret-sourced value is replaced by a placeholder (safe to write to
//! status), and a SHA-256 checksum of the full object used to detect changes.

use crate::constants::REDACTED_PARAMETER_VALUE;
use crate::crd::ParametersFromSource;
use crate::osb::JsonObject;
use crate::store::{ObjectKey, SharedStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors building request parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParametersError {
    #[error("{origin} must be a JSON object")]
    NotAnObject { origin: String },

    #[error("parameters key {key:?} is defined by both {first} and {second}")]
    Collision {
        key: String,
        first: String,
        second: String,
    },

    #[error("parametersFrom source must set secretKeyRef")]
    EmptySource,

    #[error("secret {secret} referenced by parametersFrom does not exist")]
    SecretNotFound { secret: String },

    #[error("secret {secret} has no key {key:?}")]
    SecretKeyNotFound { secret: String, key: String },

    #[error("secret {secret} key {key:?} is not a JSON object: {message}")]
    InvalidSecretValue {
        secret: String,
        key: String,
        message: String,
    },

    /// Reading a secret failed for a reason other than absence.
    #[error("failed to read parameters secret: {0}")]
    Store(StoreError),
}

impl ParametersError {
    /// Whether the same spec may succeed on a later attempt.
    ///
    /// A referenced secret or key that does not exist yet can still be created.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SecretNotFound { .. } | Self::SecretKeyNotFound { .. } => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Merged parameters ready for a broker request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedParameters {
    /// Everything, secret values included. Only ever sent to the broker.
    pub parameters: JsonObject,
    /// Same keys, with secret-sourced values redacted.
    pub redacted: JsonObject,
    /// Hex SHA-256 of the canonical JSON of `parameters`; `None` when empty.
    pub checksum: Option<String>,
}

impl ResolvedParameters {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameters for the wire, `None` when there are none.
    #[must_use]
    pub fn for_request(&self) -> Option<JsonObject> {
        if self.parameters.is_empty() {
            None
        } else {
            Some(self.parameters.clone())
        }
    }

    /// Redacted parameters for status, `None` when there are none.
    #[must_use]
    pub fn for_status(&self) -> Option<Value> {
        if self.redacted.is_empty() {
            None
        } else {
            Some(Value::Object(self.redacted.clone()))
        }
    }
}

/// Inputs of a parameter build for one entity.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParameterSources<'a> {
    /// Namespace holding `parametersFrom` secrets.
    pub namespace: &'a str,
    pub inline: Option<&'a Value>,
    pub parameters_from: &'a [ParametersFromSource],
    /// Lower-precedence defaults, lowest first (class, then plan).
    pub defaults: &'a [Option<&'a Value>],
}

/// Build the merged parameters, reading `parametersFrom` secrets from `secrets`.
///
/// # Errors
///
/// Fails on a malformed or missing source, or a key defined by two sources.
pub async fn build_parameters(
    secrets: &SharedStore<Secret>,
    sources: ParameterSources<'_>,
) -> Result<ResolvedParameters, ParametersError> {
    let mut merged = JsonObject::new();
    for (index, defaults) in sources.defaults.iter().enumerate() {
        if let Some(value) = defaults {
            let object = as_object(value, &format!("defaultProvisionParameters[{index}]"))?;
            merged.extend(object.clone());
        }
    }

    // Keys owned by the entity, mapped to where they came from.
    let mut origins: BTreeMap<String, String> = BTreeMap::new();
    let mut user = JsonObject::new();
    let mut secret_keys: Vec<String> = Vec::new();

    if let Some(inline) = sources.inline {
        let object = as_object(inline, "spec.parameters")?;
        for (key, value) in object {
            origins.insert(key.clone(), "spec.parameters".to_string());
            user.insert(key.clone(), value.clone());
        }
    }

    for source in sources.parameters_from {
        let reference = source
            .secret_key_ref
            .as_ref()
            .ok_or(ParametersError::EmptySource)?;
        let origin = format!(
            "secret {}/{} key {:?}",
            sources.namespace, reference.name, reference.key
        );
        let object =
            read_secret_object(secrets, sources.namespace, &reference.name, &reference.key)
                .await?;
        for (key, value) in object {
            if let Some(first) = origins.get(&key) {
                return Err(ParametersError::Collision {
                    key,
                    first: first.clone(),
                    second: origin,
                });
            }
            origins.insert(key.clone(), origin.clone());
            secret_keys.push(key.clone());
            user.insert(key, value);
        }
    }

    merged.extend(user);

    let mut redacted = merged.clone();
    for key in &secret_keys {
        redacted.insert(
            key.clone(),
            Value::String(REDACTED_PARAMETER_VALUE.to_string()),
        );
    }

    let digest = (!merged.is_empty()).then(|| checksum(&merged));

    Ok(ResolvedParameters {
        parameters: merged,
        redacted,
        checksum: digest,
    })
}

/// Hex SHA-256 of the canonical JSON encoding.
///
/// `serde_json` maps keep keys sorted, so equal objects always hash equally.
#[must_use]
pub fn checksum(parameters: &JsonObject) -> String {
    let canonical = Value::Object(parameters.clone()).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn as_object<'v>(value: &'v Value, origin: &str) -> Result<&'v JsonObject, ParametersError> {
    value.as_object().ok_or_else(|| ParametersError::NotAnObject {
        origin: origin.to_string(),
    })
}

async fn read_secret_object(
    secrets: &SharedStore<Secret>,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<JsonObject, ParametersError> {
    let secret_key = ObjectKey::namespaced(namespace, name);
    let secret = match secrets.get(&secret_key).await {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => {
            return Err(ParametersError::SecretNotFound {
                secret: secret_key.to_string(),
            })
        }
        Err(e) => return Err(ParametersError::Store(e)),
    };

    let bytes = secret_value(&secret, key).ok_or_else(|| ParametersError::SecretKeyNotFound {
        secret: secret_key.to_string(),
        key: key.to_string(),
    })?;

    let invalid = |message: String| ParametersError::InvalidSecretValue {
        secret: secret_key.to_string(),
        key: key.to_string(),
        message,
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(invalid(format!("found {}", json_type(&other)))),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Value of `key` in `data`, falling back to `stringData`.
pub(crate) fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.0.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|s| s.as_bytes().to_vec())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[path = "parameters_tests.rs"]
mod parameters_tests;
