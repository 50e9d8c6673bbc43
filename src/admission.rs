// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Validating admission webhook for `ServiceBinding` creation.
//!
//! A binding created against an instance that is already being deleted would
//! only ever fail, so the create is rejected up front. Everything else is
//! allowed: a missing instance, a store error, or any operation other than
//! `CREATE`. The binding reconciler re-checks the reference on every pass.

use crate::constants::ADMISSION_PATH;
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::reconcilers::retry::retry_store_call;
use crate::store::{ObjectKey, SharedStore};
use axum::{extract::State, routing::post, Json, Router};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared by admission handlers.
pub struct AdmissionState {
    pub instances: SharedStore<ServiceInstance>,
}

impl AdmissionState {
    #[must_use]
    pub fn new(instances: SharedStore<ServiceInstance>) -> Self {
        Self { instances }
    }
}

/// Router serving [`ADMISSION_PATH`].
pub fn admission_router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route(ADMISSION_PATH, post(validate_handler))
        .with_state(state)
}

async fn validate_handler(
    State(state): State<Arc<AdmissionState>>,
    Json(body): Json<AdmissionReview<ServiceBinding>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<ServiceBinding> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match denial_reason(&state, &req).await {
        Some(reason) => {
            info!(uid = %req.uid, reason = %reason, "Denying ServiceBinding");
            AdmissionResponse::from(&req).deny(reason)
        }
        None => AdmissionResponse::from(&req),
    };
    Json(response.into_review())
}

/// Why `req` must be rejected, or `None` to admit it.
pub async fn denial_reason(
    state: &AdmissionState,
    req: &AdmissionRequest<ServiceBinding>,
) -> Option<String> {
    if req.operation != Operation::Create {
        return None;
    }
    let binding = req.object.as_ref()?;

    // The object may arrive without a namespace; the request always carries one.
    let namespace = binding
        .namespace()
        .or_else(|| req.namespace.clone())
        .unwrap_or_default();
    let name = if binding.name_any().is_empty() {
        req.name.clone()
    } else {
        binding.name_any()
    };

    let instance_key = ObjectKey::namespaced(&namespace, &binding.spec.instance_ref.name);
    let (instances, key) = (&state.instances, &instance_key);
    let lookup = retry_store_call(move || instances.get(key), "get ServiceInstance").await;
    match lookup {
        Ok(instance) if instance.metadata.deletion_timestamp.is_some() => Some(format!(
            "ServiceBinding {namespace}/{name} references a ServiceInstance that is being deleted"
        )),
        Ok(_) => None,
        Err(e) if e.is_not_found() => {
            debug!(instance = %instance_key, "Referenced instance does not exist yet");
            None
        }
        Err(e) => {
            warn!(instance = %instance_key, error = %e, "Cannot check referenced instance; admitting");
            None
        }
    }
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod admission_tests;
