// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Service binding reconciliation.
//!
//! One operation per pass, in this order:
//!
//! 1. **Poll** - an asynchronous bind or unbind is running
//! 2. **Unbind** - the binding is being deleted and the broker may hold credentials
//! 3. **Orphan mitigation** - a bind ended ambiguously; unbind with backoff
//! 4. **Bind** - the parent instance is ready and no credentials were delivered yet
//!
//! Credentials never touch the binding itself. They are transformed and written
//! straight into the output secret, which the binding controls.

use super::finalizers::{has_finalizer, remove_finalizer};
use super::references::{instance_broker, load_catalog_entry, CatalogEntry};
use super::retry::orphan_mitigation_delay;
use super::status::{is_ready, set_failed, set_orphan_mitigation, set_ready};
use super::{
    client_for_broker_key, failed_for_generation, finish_pass, generate_external_id,
    now_rfc3339, originating_identity, request_context, retry_window_expired, ReconcileError,
    Tracked,
};
use crate::constants::{KIND_SERVICE_BINDING, REQUEUE_WHEN_WAITING_SECS};
use crate::context::Context;
use crate::crd::{
    plan_is_bindable, CatalogScope, ServiceBinding, ServiceBindingOperation,
    ServiceBindingPropertiesState, ServiceBindingStatus, ServiceInstance, UnbindStatus,
};
use crate::dispatcher::{Action, Reconciler};
use crate::injector::{credentials_from_json, render_secret_data, InjectError};
use crate::labels::FINALIZER_SERVICE_CATALOG;
use crate::osb::{
    BindRequest, BindResponse, BrokerClient, GetBindingRequest, GetBindingResponse, JsonObject,
    LastOperationRequest, OsbError, UnbindRequest,
};
use crate::parameters::{build_parameters, ParameterSources, ResolvedParameters};
use crate::poller::{PollOutcome, PollTarget};
use crate::status_reasons::{
    REASON_BINDING, REASON_BIND_CALL_FAILED, REASON_INJECTED_BIND_RESULT,
    REASON_INSTANCE_BEING_DELETED, REASON_INSTANCE_NOT_READY,
    REASON_INSTANCE_OPERATION_IN_PROGRESS, REASON_NONEXISTENT_INSTANCE, REASON_NON_BINDABLE,
    REASON_ORPHAN_MITIGATION_FAILED, REASON_POLL_LAST_OPERATION_ERROR,
    REASON_RECONCILIATION_RETRY_TIMEOUT, REASON_STARTING_BINDING_ORPHAN_MITIGATION,
    REASON_UNBINDING, REASON_UNBIND_CALL_FAILED, REASON_UNBOUND_SUCCESSFULLY,
};
use crate::store::{ObjectKey, SharedStore};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BIND_IN_FLIGHT_MESSAGE: &str = "Bind request for ServiceBinding in-flight to Broker";
const ASYNC_BINDING_MESSAGE: &str = "The binding is being created asynchronously";
const INJECTED_MESSAGE: &str = "Injected bind result";
const UNBIND_IN_FLIGHT_MESSAGE: &str = "Unbind request for ServiceBinding in-flight to Broker";
const ASYNC_UNBINDING_MESSAGE: &str = "The binding is being deleted asynchronously";
const UNBOUND_MESSAGE: &str = "The binding was deleted from the broker successfully";
const RETRY_TIMEOUT_MESSAGE: &str =
    "Stopped retrying the operation because the reconciliation retry duration elapsed";

/// Where the parent instance lives on its broker.
struct BrokerTarget {
    instance_id: String,
    service_id: String,
    plan_id: String,
    scope: CatalogScope,
    broker: ObjectKey,
}

impl BrokerTarget {
    fn from_entry(instance: &ServiceInstance, entry: &CatalogEntry) -> Self {
        Self {
            instance_id: instance.spec.external_id.clone(),
            service_id: entry.class.external_id.clone(),
            plan_id: entry.plan.external_id.clone(),
            scope: entry.scope,
            broker: entry.broker.clone(),
        }
    }
}

/// Reconciles `ServiceBinding`.
pub struct BindingReconciler {
    ctx: Arc<Context>,
}

impl BindingReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for BindingReconciler {
    fn kind(&self) -> &'static str {
        KIND_SERVICE_BINDING
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let store = &self.ctx.stores.service_bindings;
        let binding = match store.get(key).await {
            Ok(binding) => binding,
            Err(e) if e.is_not_found() => {
                debug!("ServiceBinding {} no longer exists", key);
                self.ctx.poller.stop(&PollTarget::Binding(key.clone()));
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let mut pass = Tracked::new(binding);
        let result = self.step(&mut pass).await;
        finish_pass(&mut pass, store, result).await
    }
}

impl BindingReconciler {
    fn store(&self) -> &SharedStore<ServiceBinding> {
        &self.ctx.stores.service_bindings
    }

    async fn step(
        &self,
        pass: &mut Tracked<ServiceBinding>,
    ) -> Result<Option<Action>, ReconcileError> {
        if pass.current().async_op_in_progress {
            return self.handle_poll(pass).await;
        }
        if pass.obj.is_being_deleted() {
            return self.unbind(pass).await;
        }
        self.prepare(pass).await?;

        let status = pass.current();
        if status.orphan_mitigation_in_progress {
            return self.mitigate_orphan(pass).await;
        }
        let generation = pass.generation();
        if failed_for_generation(&status, generation) {
            debug!("ServiceBinding {} failed for generation {}, waiting for a spec change", pass.key(), generation);
            return Ok(Some(Action::await_change()));
        }
        if status.external_properties.is_some() {
            if status.reconciled_generation < generation {
                debug!("ServiceBinding {} is already bound; spec changes after binding are not sent", pass.key());
                pass.status().reconciled_generation = generation;
            }
            return Ok(Some(Action::await_change()));
        }
        self.bind(pass).await
    }

    /// Add the finalizer and an external ID in a single spec write.
    async fn prepare(&self, pass: &mut Tracked<ServiceBinding>) -> Result<(), ReconcileError> {
        let needs_finalizer = !has_finalizer(&pass.obj, FINALIZER_SERVICE_CATALOG);
        let needs_id = pass.obj.spec.external_id.is_empty();
        if !needs_finalizer && !needs_id {
            return Ok(());
        }

        let mut updated = pass.obj.clone();
        if needs_finalizer {
            updated.finalizers_mut().push(FINALIZER_SERVICE_CATALOG.to_string());
        }
        if needs_id {
            updated.spec.external_id = generate_external_id();
            info!("Generated external ID {} for ServiceBinding {}", updated.spec.external_id, pass.key());
        }
        let written = self.store().replace(&updated).await?;
        pass.adopt(written);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bind
    // ------------------------------------------------------------------

    async fn bind(&self, pass: &mut Tracked<ServiceBinding>) -> Result<Option<Action>, ReconcileError> {
        let instance = self.parent_instance(&pass.obj).await?;
        if instance.is_being_deleted() {
            return Err(ReconcileError::validation(
                REASON_INSTANCE_BEING_DELETED,
                format!(
                    "ServiceBinding {} references a ServiceInstance that is being deleted",
                    pass.key()
                ),
            ));
        }
        let instance_status = instance.status.clone().unwrap_or_default();
        if !is_ready(&instance_status) || instance_status.async_op_in_progress {
            return Err(ReconcileError::transient(
                REASON_INSTANCE_NOT_READY,
                format!(
                    "ServiceInstance {} is not ready; binding waits for it",
                    ObjectKey::of(&instance)
                ),
            ));
        }
        let entry = load_catalog_entry(&self.ctx, &instance).await?;
        if !plan_is_bindable(&entry.class, &entry.plan) {
            return Err(ReconcileError::validation(
                REASON_NON_BINDABLE,
                format!(
                    "Plan {:?} of class {:?} does not allow bindings",
                    entry.plan.external_name, entry.class.external_name
                ),
            ));
        }
        self.check_retry_window(pass, ServiceBindingOperation::Bind)?;

        let parameters = self.resolve_parameters(&pass.obj).await?;
        let target = BrokerTarget::from_entry(&instance, &entry);
        let client = client_for_broker_key(&self.ctx, target.scope, &target.broker).await?;

        let generation = pass.generation();
        let properties = ServiceBindingPropertiesState {
            parameters: parameters.for_status(),
            parameter_checksum: parameters.checksum.clone(),
            user_info: pass.obj.spec.user_info.clone(),
        };
        let status = pass.status();
        begin_operation(
            status,
            ServiceBindingOperation::Bind,
            Some(properties),
            generation,
            REASON_BINDING,
            BIND_IN_FLIGHT_MESSAGE,
        );
        status.unbind_status = UnbindStatus::Required;
        pass.save(self.store()).await?;

        info!(
            "Binding ServiceBinding {} to ServiceInstance {}",
            pass.key(),
            ObjectKey::of(&instance)
        );
        let request = self.bind_request(&pass.obj, &instance, &target, &parameters);
        let result = client.bind(&request).await;
        self.ctx.metrics.record_osb_request("bind", &result);

        match result {
            Ok(response) => self.handle_bind_response(pass, &target, client, response).await,
            Err(e) => match ReconcileError::from_osb(REASON_BIND_CALL_FAILED, "Error binding ServiceBinding", &e) {
                ReconcileError::Orphan { message, .. } => {
                    warn!("Bind of ServiceBinding {} ended ambiguously: {}", pass.key(), message);
                    self.start_orphan_mitigation(pass.status(), &message);
                    Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
                }
                err if err.is_terminal() => {
                    let status = pass.status();
                    status.unbind_status = UnbindStatus::NotRequired;
                    clear_operation(status);
                    Err(err)
                }
                err => Err(err),
            },
        }
    }

    async fn handle_bind_response(
        &self,
        pass: &mut Tracked<ServiceBinding>,
        target: &BrokerTarget,
        client: Arc<dyn BrokerClient>,
        response: BindResponse,
    ) -> Result<Option<Action>, ReconcileError> {
        if response.is_async {
            let status = pass.status();
            status.async_op_in_progress = true;
            status.last_operation = response.operation_key;
            set_ready(status, false, REASON_BINDING, ASYNC_BINDING_MESSAGE);
            self.poll(&pass.obj, target, client);
            return Ok(Some(Action::await_change()));
        }
        match response.credentials {
            Some(credentials) => self.complete_bind(pass, &credentials).await,
            None => {
                let message = "The broker answered the bind without credentials";
                warn!("ServiceBinding {}: {}", pass.key(), message);
                self.start_orphan_mitigation(pass.status(), message);
                Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
            }
        }
    }

    /// Write the credentials to the output secret and mark the binding ready.
    async fn complete_bind(
        &self,
        pass: &mut Tracked<ServiceBinding>,
        credentials: &JsonObject,
    ) -> Result<Option<Action>, ReconcileError> {
        if let Err(e) = self.inject(&pass.obj, credentials).await {
            warn!("Failed to inject credentials for ServiceBinding {}: {}", pass.key(), e);
            let err = ReconcileError::from(e);
            if err.is_terminal() {
                // unbindStatus stays Required: the broker holds the credentials.
                clear_operation(pass.status());
            }
            return Err(err);
        }
        info!("Injected credentials for ServiceBinding {} into secret {}", pass.key(), pass.obj.secret_name());
        commit(pass.status());
        Ok(Some(Action::await_change()))
    }

    async fn inject(&self, binding: &ServiceBinding, credentials: &JsonObject) -> Result<(), InjectError> {
        let namespace = binding.namespace().unwrap_or_default();
        let transformed = self
            .ctx
            .injector
            .transform(&namespace, credentials_from_json(credentials), &binding.spec.secret_transforms)
            .await?;
        let data = render_secret_data(&transformed, binding.spec.secret_key.as_deref())?;
        self.ctx.injector.inject(binding, data).await
    }

    /// Credentials of an asynchronous bind that just succeeded.
    ///
    /// Brokers advertising `bindings_retrievable` are asked with a GET; the others
    /// receive the same bind request again, which returns the existing binding.
    async fn fetch_credentials(
        &self,
        pass: &mut Tracked<ServiceBinding>,
    ) -> Result<Option<Action>, ReconcileError> {
        let instance = self.parent_instance(&pass.obj).await?;
        let entry = load_catalog_entry(&self.ctx, &instance).await?;
        let target = BrokerTarget::from_entry(&instance, &entry);
        let client = client_for_broker_key(&self.ctx, target.scope, &target.broker).await?;

        if entry.class.binding_retrievable {
            let request = GetBindingRequest {
                instance_id: target.instance_id.clone(),
                binding_id: pass.obj.spec.external_id.clone(),
            };
            let result = client.get_binding(&request).await;
            self.ctx.metrics.record_osb_request("get_binding", &result);
            return match result {
                Ok(GetBindingResponse {
                    credentials: Some(credentials),
                    ..
                }) => {
                    self.clear_async(pass);
                    self.complete_bind(pass, &credentials).await
                }
                Ok(_) => {
                    let message = "The broker returned the binding without credentials";
                    self.start_orphan_mitigation(pass.status(), message);
                    Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
                }
                Err(e) => self.fetch_failed(pass, &e),
            };
        }

        let parameters = self.resolve_parameters(&pass.obj).await?;
        let request = self.bind_request(&pass.obj, &instance, &target, &parameters);
        let result = client.bind(&request).await;
        self.ctx.metrics.record_osb_request("bind", &result);
        match result {
            Ok(response) => {
                self.clear_async(pass);
                self.handle_bind_response(pass, &target, client, response).await
            }
            Err(e) => self.fetch_failed(pass, &e),
        }
    }

    /// A retryable failure keeps the async flag so the next pass polls and fetches
    /// again; anything else means the credentials cannot be obtained.
    fn fetch_failed(
        &self,
        pass: &mut Tracked<ServiceBinding>,
        err: &OsbError,
    ) -> Result<Option<Action>, ReconcileError> {
        let classified = ReconcileError::from_osb(
            REASON_BIND_CALL_FAILED,
            "Error fetching credentials of ServiceBinding",
            err,
        );
        if err.is_retryable() {
            return Err(ReconcileError::transient(classified.reason(), classified.to_string()));
        }
        self.start_orphan_mitigation(pass.status(), &classified.to_string());
        Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
    }

    fn clear_async(&self, pass: &mut Tracked<ServiceBinding>) {
        let status = pass.status();
        status.async_op_in_progress = false;
        status.last_operation = None;
    }

    fn bind_request(
        &self,
        binding: &ServiceBinding,
        instance: &ServiceInstance,
        target: &BrokerTarget,
        parameters: &ResolvedParameters,
    ) -> BindRequest {
        let namespace = binding.namespace().unwrap_or_default();
        BindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: target.instance_id.clone(),
            accepts_incomplete: true,
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            app_guid: Some(namespace.clone()),
            parameters: parameters.for_request(),
            context: Some(request_context(&self.ctx.settings, &namespace, &instance.name_any())),
            originating_identity: originating_identity(binding.spec.user_info.as_ref()),
        }
    }

    // ------------------------------------------------------------------
    // Unbind
    // ------------------------------------------------------------------

    async fn unbind(&self, pass: &mut Tracked<ServiceBinding>) -> Result<Option<Action>, ReconcileError> {
        let key = pass.key();
        if !has_finalizer(&pass.obj, FINALIZER_SERVICE_CATALOG) {
            self.ctx.poller.stop(&PollTarget::Binding(key));
            return Ok(None);
        }

        let status = pass.current();
        match status.unbind_status {
            UnbindStatus::NotRequired | UnbindStatus::Succeeded => {
                self.ctx.injector.eject(&pass.obj).await?;
                return self.release(pass).await;
            }
            UnbindStatus::Failed => {
                debug!("Unbind of ServiceBinding {} failed, finalizer stays", key);
                return Ok(Some(Action::await_change()));
            }
            UnbindStatus::Required => {}
        }

        if self.retry_window_exceeded(&status, ServiceBindingOperation::Unbind) {
            let status = pass.status();
            clear_operation(status);
            status.unbind_status = UnbindStatus::Failed;
            return Err(ReconcileError::validation(
                REASON_RECONCILIATION_RETRY_TIMEOUT,
                RETRY_TIMEOUT_MESSAGE,
            ));
        }

        let (instance, target) = self.instance_target(&pass.obj).await?;
        if instance.status.as_ref().is_some_and(|s| s.async_op_in_progress) {
            set_ready(
                pass.status(),
                false,
                REASON_INSTANCE_OPERATION_IN_PROGRESS,
                &format!(
                    "Unbind waits for the asynchronous operation on ServiceInstance {} to finish",
                    ObjectKey::of(&instance)
                ),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(REQUEUE_WHEN_WAITING_SECS))));
        }
        let client = client_for_broker_key(&self.ctx, target.scope, &target.broker).await?;

        let generation = pass.generation();
        begin_operation(
            pass.status(),
            ServiceBindingOperation::Unbind,
            None,
            generation,
            REASON_UNBINDING,
            UNBIND_IN_FLIGHT_MESSAGE,
        );
        pass.save(self.store()).await?;

        info!("Unbinding ServiceBinding {}", key);
        let result = client.unbind(&unbind_request(&pass.obj, &target)).await;
        self.ctx.metrics.record_osb_request("unbind", &result);

        match result {
            Ok(response) if response.is_async => {
                let status = pass.status();
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                set_ready(status, false, REASON_UNBINDING, ASYNC_UNBINDING_MESSAGE);
                self.poll(&pass.obj, &target, client);
                Ok(Some(Action::await_change()))
            }
            Ok(_) => {
                commit_unbind(pass.status());
                self.ctx.injector.eject(&pass.obj).await?;
                self.release(pass).await
            }
            Err(e) => {
                let err = ReconcileError::from_osb(REASON_UNBIND_CALL_FAILED, "Error unbinding ServiceBinding", &e);
                if err.is_terminal() {
                    let status = pass.status();
                    clear_operation(status);
                    status.unbind_status = UnbindStatus::Failed;
                    Err(err)
                } else {
                    Err(ReconcileError::transient(err.reason(), err.to_string()))
                }
            }
        }
    }

    /// Write the final status and drop the finalizer.
    async fn release(
        &self,
        pass: &mut Tracked<ServiceBinding>,
    ) -> Result<Option<Action>, ReconcileError> {
        pass.save(self.store()).await?;
        remove_finalizer(self.store(), &pass.obj, FINALIZER_SERVICE_CATALOG).await?;
        self.ctx.poller.stop(&PollTarget::Binding(pass.key()));
        info!("Released ServiceBinding {} for deletion", pass.key());
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Orphan mitigation
    // ------------------------------------------------------------------

    fn start_orphan_mitigation(&self, status: &mut ServiceBindingStatus, message: &str) {
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.orphan_mitigation_in_progress = true;
        status.orphan_mitigation_attempts = 0;
        set_orphan_mitigation(status, true, REASON_STARTING_BINDING_ORPHAN_MITIGATION, message);
        set_ready(status, false, REASON_STARTING_BINDING_ORPHAN_MITIGATION, message);
        self.ctx.metrics.record_orphan_mitigation(KIND_SERVICE_BINDING);
    }

    async fn mitigate_orphan(
        &self,
        pass: &mut Tracked<ServiceBinding>,
    ) -> Result<Option<Action>, ReconcileError> {
        let status = pass.current();
        let limit = self.ctx.settings.orphan_mitigation_attempts;
        if status.orphan_mitigation_attempts >= limit {
            warn!("Orphan mitigation for ServiceBinding {} gave up after {} attempts", pass.key(), limit);
            fail_orphan_mitigation(
                pass.status(),
                &format!("Orphan mitigation failed after {limit} unbind attempts"),
            );
            return Ok(Some(Action::await_change()));
        }

        let (_, target) = self.instance_target(&pass.obj).await?;
        let client = client_for_broker_key(&self.ctx, target.scope, &target.broker).await?;

        let attempt = status.orphan_mitigation_attempts + 1;
        info!("Orphan mitigation for ServiceBinding {}: unbind attempt {}", pass.key(), attempt);
        let result = client.unbind(&unbind_request(&pass.obj, &target)).await;
        self.ctx.metrics.record_osb_request("unbind", &result);

        match result {
            Ok(response) if response.is_async => {
                let status = pass.status();
                status.current_operation = Some(ServiceBindingOperation::Unbind);
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                self.poll(&pass.obj, &target, client);
                Ok(Some(Action::await_change()))
            }
            Ok(_) => {
                self.ctx.injector.eject(&pass.obj).await?;
                finish_orphan_mitigation(pass.status());
                Ok(Some(Action::await_change()))
            }
            Err(e) => {
                let status = pass.status();
                status.orphan_mitigation_attempts = attempt;
                set_ready(
                    status,
                    false,
                    REASON_UNBIND_CALL_FAILED,
                    &format!("Orphan mitigation unbind attempt {attempt} failed: {}", e.summary()),
                );
                Ok(Some(Action::requeue(orphan_mitigation_delay(attempt))))
            }
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    async fn handle_poll(
        &self,
        pass: &mut Tracked<ServiceBinding>,
    ) -> Result<Option<Action>, ReconcileError> {
        let key = pass.key();
        let target = PollTarget::Binding(key.clone());
        let status = pass.current();
        let Some(operation) = status.current_operation else {
            warn!("ServiceBinding {} has an async operation but no current operation", key);
            self.clear_async(pass);
            return Ok(Some(Action::requeue(Duration::ZERO)));
        };

        let Some(outcome) = self.ctx.poller.take_outcome(&target) else {
            if !self.ctx.poller.is_polling(&target) {
                let (_, broker_target) = self.instance_target(&pass.obj).await?;
                let client =
                    client_for_broker_key(&self.ctx, broker_target.scope, &broker_target.broker).await?;
                self.poll(&pass.obj, &broker_target, client);
            }
            return Ok(Some(Action::await_change()));
        };
        debug!("Poll outcome for ServiceBinding {}: {:?}", key, outcome);

        let mitigating = status.orphan_mitigation_in_progress;
        match (operation, outcome) {
            (_, PollOutcome::InProgress { description }) => {
                let (reason, fallback) = match operation {
                    ServiceBindingOperation::Bind => (REASON_BINDING, ASYNC_BINDING_MESSAGE),
                    ServiceBindingOperation::Unbind => (REASON_UNBINDING, ASYNC_UNBINDING_MESSAGE),
                };
                set_ready(pass.status(), false, reason, description.as_deref().unwrap_or(fallback));
                Ok(Some(Action::await_change()))
            }

            (ServiceBindingOperation::Bind, PollOutcome::Succeeded { .. }) => {
                info!("Asynchronous bind of ServiceBinding {} succeeded", key);
                self.fetch_credentials(pass).await
            }

            (ServiceBindingOperation::Bind, PollOutcome::Gone) => {
                let status = pass.status();
                status.unbind_status = UnbindStatus::NotRequired;
                status.reconciled_generation = status.observed_generation;
                clear_operation(status);
                set_failed(
                    status,
                    REASON_BIND_CALL_FAILED,
                    "The broker no longer knows the binding being created",
                );
                Ok(Some(Action::await_change()))
            }

            (ServiceBindingOperation::Bind, outcome) => {
                let message = match outcome {
                    PollOutcome::Error(e) => format!("Error polling last operation: {}", e.summary()),
                    PollOutcome::Failed { description } => format!(
                        "Asynchronous bind failed: {}",
                        description.as_deref().unwrap_or("no description")
                    ),
                    _ => "Asynchronous bind failed".to_string(),
                };
                warn!("ServiceBinding {}: {}", key, message);
                self.start_orphan_mitigation(pass.status(), &message);
                Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
            }

            (ServiceBindingOperation::Unbind, PollOutcome::Succeeded { .. } | PollOutcome::Gone) => {
                self.ctx.injector.eject(&pass.obj).await?;
                if mitigating {
                    finish_orphan_mitigation(pass.status());
                    return Ok(Some(Action::await_change()));
                }
                commit_unbind(pass.status());
                if pass.obj.is_being_deleted() {
                    return self.release(pass).await;
                }
                Ok(Some(Action::await_change()))
            }

            (ServiceBindingOperation::Unbind, outcome) => {
                let (reason, message) = match outcome {
                    PollOutcome::Error(e) => (
                        REASON_POLL_LAST_OPERATION_ERROR,
                        format!("Error polling last operation: {}", e.summary()),
                    ),
                    PollOutcome::Failed { description } => (
                        REASON_UNBIND_CALL_FAILED,
                        format!(
                            "Asynchronous unbind failed: {}",
                            description.as_deref().unwrap_or("no description")
                        ),
                    ),
                    _ => (REASON_UNBIND_CALL_FAILED, String::new()),
                };
                let status = pass.status();
                status.async_op_in_progress = false;
                status.last_operation = None;
                if mitigating {
                    status.orphan_mitigation_attempts += 1;
                    let attempt = status.orphan_mitigation_attempts;
                    set_ready(status, false, REASON_UNBIND_CALL_FAILED, &message);
                    return Ok(Some(Action::requeue(orphan_mitigation_delay(attempt))));
                }
                clear_operation(status);
                status.unbind_status = UnbindStatus::Failed;
                status.reconciled_generation = status.observed_generation;
                set_failed(status, reason, &message);
                Ok(Some(Action::await_change()))
            }
        }
    }

    /// Start (or keep) polling the operation recorded in the binding status.
    fn poll(&self, binding: &ServiceBinding, target: &BrokerTarget, client: Arc<dyn BrokerClient>) {
        let request = LastOperationRequest {
            instance_id: target.instance_id.clone(),
            binding_id: Some(binding.spec.external_id.clone()),
            service_id: Some(target.service_id.clone()).filter(|s| !s.is_empty()),
            plan_id: Some(target.plan_id.clone()).filter(|s| !s.is_empty()),
            operation_key: binding.status.as_ref().and_then(|s| s.last_operation.clone()),
            originating_identity: originating_identity(binding.spec.user_info.as_ref()),
        };
        self.ctx.poller.start(
            PollTarget::Binding(ObjectKey::of(binding)),
            client,
            request,
            self.ctx.queues.service_bindings.clone(),
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn parent_instance(&self, binding: &ServiceBinding) -> Result<ServiceInstance, ReconcileError> {
        let key = ObjectKey::namespaced(
            binding.namespace().unwrap_or_default(),
            &binding.spec.instance_ref.name,
        );
        match self.ctx.stores.service_instances.get(&key).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => Err(ReconcileError::transient(
                REASON_NONEXISTENT_INSTANCE,
                format!("References a non-existent ServiceInstance {key}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// The parent instance and the IDs the broker last confirmed for it.
    async fn instance_target(
        &self,
        binding: &ServiceBinding,
    ) -> Result<(ServiceInstance, BrokerTarget), ReconcileError> {
        let instance = self.parent_instance(binding).await?;
        let status = instance.status.clone().unwrap_or_default();
        let Some(view) = status.external_properties.or(status.in_progress_properties) else {
            return Err(ReconcileError::transient(
                REASON_NONEXISTENT_INSTANCE,
                format!(
                    "ServiceInstance {} has no broker state to unbind from",
                    ObjectKey::of(&instance)
                ),
            ));
        };
        let (scope, broker) = instance_broker(&self.ctx, &instance).await?;
        let target = BrokerTarget {
            instance_id: instance.spec.external_id.clone(),
            service_id: view.class_external_id,
            plan_id: view.plan_external_id,
            scope,
            broker,
        };
        Ok((instance, target))
    }

    fn retry_window_exceeded(
        &self,
        status: &ServiceBindingStatus,
        operation: ServiceBindingOperation,
    ) -> bool {
        status.current_operation == Some(operation)
            && retry_window_expired(
                status.operation_start_time.as_deref(),
                self.ctx.settings.reconciliation_retry_duration,
            )
    }

    fn check_retry_window(
        &self,
        pass: &mut Tracked<ServiceBinding>,
        operation: ServiceBindingOperation,
    ) -> Result<(), ReconcileError> {
        if !self.retry_window_exceeded(&pass.current(), operation) {
            return Ok(());
        }
        warn!("Giving up on {:?} of ServiceBinding {}", operation, pass.key());
        let status = pass.status();
        clear_operation(status);
        status.unbind_status = UnbindStatus::NotRequired;
        Err(ReconcileError::validation(
            REASON_RECONCILIATION_RETRY_TIMEOUT,
            RETRY_TIMEOUT_MESSAGE,
        ))
    }

    /// Binding parameters merge like instance-level parameters, without defaults.
    async fn resolve_parameters(
        &self,
        binding: &ServiceBinding,
    ) -> Result<ResolvedParameters, ReconcileError> {
        let namespace = binding.namespace().unwrap_or_default();
        let sources = ParameterSources {
            namespace: &namespace,
            inline: binding.spec.parameters.as_ref(),
            parameters_from: &binding.spec.parameters_from,
            defaults: &[],
        };
        Ok(build_parameters(&self.ctx.stores.secrets, sources).await?)
    }
}

fn unbind_request(binding: &ServiceBinding, target: &BrokerTarget) -> UnbindRequest {
    UnbindRequest {
        binding_id: binding.spec.external_id.clone(),
        instance_id: target.instance_id.clone(),
        accepts_incomplete: true,
        service_id: target.service_id.clone(),
        plan_id: target.plan_id.clone(),
        originating_identity: originating_identity(binding.spec.user_info.as_ref()),
    }
}

fn begin_operation(
    status: &mut ServiceBindingStatus,
    operation: ServiceBindingOperation,
    properties: Option<ServiceBindingPropertiesState>,
    generation: i64,
    reason: &str,
    message: &str,
) {
    if status.current_operation != Some(operation) || status.operation_start_time.is_none() {
        status.operation_start_time = Some(now_rfc3339());
    }
    status.current_operation = Some(operation);
    status.observed_generation = generation;
    if properties.is_some() {
        status.in_progress_properties = properties;
    }
    set_ready(status, false, reason, message);
}

fn clear_operation(status: &mut ServiceBindingStatus) {
    status.current_operation = None;
    status.operation_start_time = None;
    status.in_progress_properties = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
}

fn commit(status: &mut ServiceBindingStatus) {
    status.external_properties = status.in_progress_properties.take();
    clear_operation(status);
    status.reconciled_generation = status.observed_generation;
    set_ready(status, true, REASON_INJECTED_BIND_RESULT, INJECTED_MESSAGE);
}

fn commit_unbind(status: &mut ServiceBindingStatus) {
    clear_operation(status);
    status.unbind_status = UnbindStatus::Succeeded;
    status.external_properties = None;
    status.orphan_mitigation_in_progress = false;
    set_orphan_mitigation(status, false, "", "");
    set_ready(status, false, REASON_UNBOUND_SUCCESSFULLY, UNBOUND_MESSAGE);
}

/// The broker's copy of a failed bind is gone; the bind itself still failed.
fn finish_orphan_mitigation(status: &mut ServiceBindingStatus) {
    clear_operation(status);
    status.orphan_mitigation_in_progress = false;
    status.unbind_status = UnbindStatus::Succeeded;
    status.reconciled_generation = status.observed_generation;
    set_orphan_mitigation(status, false, "", "");
    set_failed(
        status,
        REASON_BIND_CALL_FAILED,
        "Bind failed; orphan mitigation removed the binding from the broker",
    );
}

fn fail_orphan_mitigation(status: &mut ServiceBindingStatus, message: &str) {
    clear_operation(status);
    status.orphan_mitigation_in_progress = false;
    status.unbind_status = UnbindStatus::Failed;
    status.reconciled_generation = status.observed_generation;
    set_orphan_mitigation(status, false, "", "");
    set_failed(status, REASON_ORPHAN_MITIGATION_FAILED, message);
}

#[cfg(test)]
#[path = "binding_tests.rs"]
mod binding_tests;
