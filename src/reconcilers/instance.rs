// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Service instance reconciliation.
//!
//! Each pass picks one operation from the observed status:
//!
//! 1. **Poll** - an asynchronous operation is running; act on the poller's answer
//! 2. **Deprovision** - the instance is being deleted and the broker may hold it
//! 3. **Orphan mitigation** - a provision failed ambiguously; deprovision with backoff
//! 4. **Provision** - the instance has never been provisioned
//! 5. **Update** - the generation or `updateRequests` moved past what the broker saw
//!
//! Status is written before every broker call, so a crash mid-call still leaves
//! `deprovisionStatus=Required` behind and the instance cannot be deleted without
//! telling the broker.

use super::finalizers::{has_finalizer, remove_finalizer};
use super::references::{ensure_references, instance_broker, load_catalog_entry, CatalogEntry};
use super::retry::orphan_mitigation_delay;
use super::status::{is_ready, set_failed, set_orphan_mitigation, set_ready};
use super::{
    client_for_broker_key, failed_for_generation, finish_pass, generate_external_id,
    now_rfc3339, originating_identity, request_context, retry_window_expired, ReconcileError,
    Tracked,
};
use crate::constants::{KIND_SERVICE_INSTANCE, REQUEUE_WHEN_WAITING_SECS};
use crate::context::Context;
use crate::crd::{
    DeprovisionStatus, ServiceInstance, ServiceInstanceOperation, ServiceInstanceProvisionStatus,
    ServiceInstancePropertiesState, ServiceInstanceStatus,
};
use crate::dispatcher::{Action, Reconciler};
use crate::labels::FINALIZER_SERVICE_CATALOG;
use crate::osb::{
    BrokerClient, DeprovisionRequest, LastOperationRequest, OsbError, PreviousValues,
    ProvisionRequest, UpdateInstanceRequest,
};
use crate::parameters::{build_parameters, ParameterSources, ResolvedParameters};
use crate::poller::{PollOutcome, PollTarget};
use crate::status_reasons::{
    REASON_DEPROVISIONED_SUCCESSFULLY, REASON_DEPROVISIONING,
    REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS, REASON_DEPROVISION_CALL_FAILED,
    REASON_INSTANCE_UPDATED_SUCCESSFULLY, REASON_ORPHAN_MITIGATION_FAILED,
    REASON_PLAN_NOT_UPDATABLE, REASON_POLL_LAST_OPERATION_ERROR, REASON_PROVISIONED_SUCCESSFULLY,
    REASON_PROVISIONING, REASON_PROVISION_CALL_FAILED, REASON_RECONCILIATION_RETRY_TIMEOUT,
    REASON_REMOVED_FROM_CATALOG, REASON_STARTING_ORPHAN_MITIGATION,
    REASON_UPDATE_INSTANCE_CALL_FAILED, REASON_UPDATING_INSTANCE,
};
use crate::store::{ObjectKey, SharedStore};
use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROVISION_IN_FLIGHT_MESSAGE: &str = "Provision request for ServiceInstance in-flight to Broker";
const ASYNC_PROVISIONING_MESSAGE: &str = "The instance is being provisioned asynchronously";
const PROVISIONED_MESSAGE: &str = "The instance was provisioned successfully";
const UPDATE_IN_FLIGHT_MESSAGE: &str = "Update request for ServiceInstance in-flight to Broker";
const ASYNC_UPDATING_MESSAGE: &str = "The instance is being updated asynchronously";
const UPDATED_MESSAGE: &str = "The instance was updated successfully";
const DEPROVISION_IN_FLIGHT_MESSAGE: &str =
    "Deprovision request for ServiceInstance in-flight to Broker";
const ASYNC_DEPROVISIONING_MESSAGE: &str = "The instance is being deprovisioned asynchronously";
const DEPROVISIONED_MESSAGE: &str = "The instance was deprovisioned successfully";
const RETRY_TIMEOUT_MESSAGE: &str =
    "Stopped retrying the operation because the reconciliation retry duration elapsed";

/// Reconciles `ServiceInstance`.
pub struct InstanceReconciler {
    ctx: Arc<Context>,
}

impl InstanceReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    fn kind(&self) -> &'static str {
        KIND_SERVICE_INSTANCE
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let store = &self.ctx.stores.service_instances;
        let instance = match store.get(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                debug!("ServiceInstance {} no longer exists", key);
                self.ctx.poller.stop(&PollTarget::Instance(key.clone()));
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let mut pass = Tracked::new(instance);
        let result = self.step(&mut pass).await;
        finish_pass(&mut pass, store, result).await
    }
}

impl InstanceReconciler {
    fn store(&self) -> &SharedStore<ServiceInstance> {
        &self.ctx.stores.service_instances
    }

    async fn step(
        &self,
        pass: &mut Tracked<ServiceInstance>,
    ) -> Result<Option<Action>, ReconcileError> {
        if pass.current().async_op_in_progress {
            return self.handle_poll(pass).await;
        }
        if pass.obj.is_being_deleted() {
            return self.deprovision(pass).await;
        }
        self.prepare(pass).await?;

        let status = pass.current();
        if status.orphan_mitigation_in_progress {
            return self.mitigate_orphan(pass).await;
        }
        if failed_for_generation(&status, pass.generation()) {
            debug!("ServiceInstance {} failed for generation {}, waiting for a spec change", pass.key(), pass.generation());
            return Ok(Some(Action::await_change()));
        }

        ensure_references(&self.ctx, pass).await?;
        let entry = load_catalog_entry(&self.ctx, &pass.obj).await?;

        match status.provision_status {
            ServiceInstanceProvisionStatus::NotProvisioned => self.provision(pass, &entry).await,
            ServiceInstanceProvisionStatus::Provisioned => {
                let update_requested =
                    pass.obj.spec.update_requests > status.observed_update_requests;
                if status.reconciled_generation < pass.generation() || update_requested {
                    self.update(pass, &entry).await
                } else {
                    Ok(Some(Action::await_change()))
                }
            }
        }
    }

    /// Add the finalizer and an external ID in a single spec write.
    async fn prepare(&self, pass: &mut Tracked<ServiceInstance>) -> Result<(), ReconcileError> {
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
            info!("Generated external ID {} for ServiceInstance {}", updated.spec.external_id, pass.key());
        }
        let written = self.store().replace(&updated).await?;
        pass.adopt(written);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Provision
    // ------------------------------------------------------------------

    async fn provision(
        &self,
        pass: &mut Tracked<ServiceInstance>,
        entry: &CatalogEntry,
    ) -> Result<Option<Action>, ReconcileError> {
        if entry.class_removed || entry.plan_removed {
            return Err(ReconcileError::validation(
                REASON_REMOVED_FROM_CATALOG,
                format!(
                    "Plan {:?} of class {:?} has been removed from the broker catalog; provisioning is not possible",
                    entry.plan.external_name, entry.class.external_name
                ),
            ));
        }
        self.check_retry_window(pass, ServiceInstanceOperation::Provision)?;

        let parameters = self.resolve_parameters(&pass.obj, entry).await?;
        let client = client_for_broker_key(&self.ctx, entry.scope, &entry.broker).await?;

        let generation = pass.generation();
        let properties = properties(entry, &parameters, &pass.obj);
        let status = pass.status();
        begin_operation(
            status,
            ServiceInstanceOperation::Provision,
            Some(properties),
            generation,
            REASON_PROVISIONING,
            PROVISION_IN_FLIGHT_MESSAGE,
        );
        status.deprovision_status = DeprovisionStatus::Required;
        status.default_provision_parameters = merged_defaults(entry);
        pass.save(self.store()).await?;

        let namespace = pass.obj.namespace().unwrap_or_default();
        let request = ProvisionRequest {
            instance_id: pass.obj.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: entry.class.external_id.clone(),
            plan_id: entry.plan.external_id.clone(),
            organization_guid: self.ctx.settings.cluster_id.clone(),
            space_guid: namespace.clone(),
            parameters: parameters.for_request(),
            context: Some(request_context(&self.ctx.settings, &namespace, &pass.obj.name_any())),
            originating_identity: originating_identity(pass.obj.spec.user_info.as_ref()),
        };
        info!(
            "Provisioning ServiceInstance {} (class {:?}, plan {:?})",
            pass.key(),
            entry.class.external_name,
            entry.plan.external_name
        );
        let result = client.provision_instance(&request).await;
        self.ctx.metrics.record_osb_request("provision", &result);

        match result {
            Ok(response) if response.is_async => {
                let status = pass.status();
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                if response.dashboard_url.is_some() {
                    status.dashboard_url = response.dashboard_url;
                }
                set_ready(status, false, REASON_PROVISIONING, ASYNC_PROVISIONING_MESSAGE);
                self.poll(&pass.obj, client);
                Ok(Some(Action::await_change()))
            }
            Ok(response) => {
                info!("Provisioned ServiceInstance {}", pass.key());
                let update_requests = pass.obj.spec.update_requests;
                commit(
                    pass.status(),
                    ServiceInstanceOperation::Provision,
                    update_requests,
                    response.dashboard_url,
                );
                Ok(Some(Action::await_change()))
            }
            Err(e) if e.is_conflict() => self.provision_conflict(pass, entry, client.as_ref(), &e).await,
            Err(e) => {
                let err = ReconcileError::from_osb(
                    REASON_PROVISION_CALL_FAILED,
                    "Error provisioning ServiceInstance",
                    &e,
                );
                match err {
                    ReconcileError::Orphan { message, .. } => {
                        warn!("Provision of ServiceInstance {} ended ambiguously: {}", pass.key(), message);
                        self.start_orphan_mitigation(pass.status(), &message);
                        Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
                    }
                    err if err.is_terminal() => {
                        let status = pass.status();
                        status.deprovision_status = DeprovisionStatus::NotRequired;
                        clear_operation(status);
                        Err(err)
                    }
                    err => Err(err),
                }
            }
        }
    }

    /// A 409 is accepted when the broker already holds an identical instance.
    async fn provision_conflict(
        &self,
        pass: &mut Tracked<ServiceInstance>,
        entry: &CatalogEntry,
        client: &dyn BrokerClient,
        conflict: &OsbError,
    ) -> Result<Option<Action>, ReconcileError> {
        if entry.class.instances_retrievable {
            let result = client.get_instance(&pass.obj.spec.external_id).await;
            self.ctx.metrics.record_osb_request("get_instance", &result);
            match result {
                Ok(existing) if existing.plan_id.as_deref() == Some(entry.plan.external_id.as_str()) => {
                    info!(
                        "Broker already holds ServiceInstance {} with the requested plan, adopting it",
                        pass.key()
                    );
                    let update_requests = pass.obj.spec.update_requests;
                    commit(
                        pass.status(),
                        ServiceInstanceOperation::Provision,
                        update_requests,
                        existing.dashboard_url,
                    );
                    return Ok(Some(Action::await_change()));
                }
                Ok(existing) => debug!(
                    "Conflicting instance for {} has plan {:?}, not {:?}",
                    pass.key(),
                    existing.plan_id,
                    entry.plan.external_id
                ),
                Err(e) => warn!("Failed to fetch conflicting instance for {}: {}", pass.key(), e),
            }
        }

        let status = pass.status();
        status.deprovision_status = DeprovisionStatus::NotRequired;
        clear_operation(status);
        Err(ReconcileError::remote_terminal(
            REASON_PROVISION_CALL_FAILED,
            format!("Error provisioning ServiceInstance: {}", conflict.summary()),
        ))
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    async fn update(
        &self,
        pass: &mut Tracked<ServiceInstance>,
        entry: &CatalogEntry,
    ) -> Result<Option<Action>, ReconcileError> {
        let status = pass.current();
        let external = status.external_properties.clone().unwrap_or_default();
        let plan_changed = external.plan_external_id != entry.plan.external_id;
        if plan_changed && !entry.class.plan_updatable {
            return Err(ReconcileError::validation(
                REASON_PLAN_NOT_UPDATABLE,
                format!(
                    "The plan of an instance of class {:?} cannot be changed",
                    entry.class.external_name
                ),
            ));
        }
        if plan_changed && entry.plan_removed {
            return Err(ReconcileError::validation(
                REASON_REMOVED_FROM_CATALOG,
                format!(
                    "Plan {:?} has been removed from the broker catalog",
                    entry.plan.external_name
                ),
            ));
        }
        self.check_retry_window(pass, ServiceInstanceOperation::Update)?;

        let parameters = self.resolve_parameters(&pass.obj, entry).await?;
        let update_requests = pass.obj.spec.update_requests;
        let update_requested = update_requests > status.observed_update_requests;
        let parameters_changed = parameters.checksum != external.parameter_checksum;
        let generation = pass.generation();

        if !plan_changed && !parameters_changed && !update_requested {
            debug!("ServiceInstance {} matches what the broker holds, no update needed", pass.key());
            let status = pass.status();
            status.reconciled_generation = generation;
            status.default_provision_parameters = merged_defaults(entry);
            if !is_ready(status) {
                set_ready(status, true, REASON_INSTANCE_UPDATED_SUCCESSFULLY, UPDATED_MESSAGE);
            }
            return Ok(Some(Action::await_change()));
        }

        let client = client_for_broker_key(&self.ctx, entry.scope, &entry.broker).await?;
        let in_progress = properties(entry, &parameters, &pass.obj);
        let status = pass.status();
        begin_operation(
            status,
            ServiceInstanceOperation::Update,
            Some(in_progress),
            generation,
            REASON_UPDATING_INSTANCE,
            UPDATE_IN_FLIGHT_MESSAGE,
        );
        status.default_provision_parameters = merged_defaults(entry);
        pass.save(self.store()).await?;

        let namespace = pass.obj.namespace().unwrap_or_default();
        let request = UpdateInstanceRequest {
            instance_id: pass.obj.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: entry.class.external_id.clone(),
            plan_id: plan_changed.then(|| entry.plan.external_id.clone()),
            parameters: (parameters_changed || update_requested)
                .then(|| parameters.parameters.clone()),
            previous_values: Some(PreviousValues {
                plan_id: external.plan_external_id.clone(),
                service_id: external.class_external_id.clone(),
            }),
            context: Some(request_context(&self.ctx.settings, &namespace, &pass.obj.name_any())),
            originating_identity: originating_identity(pass.obj.spec.user_info.as_ref()),
        };
        info!(
            "Updating ServiceInstance {} (plan changed: {}, parameters changed: {})",
            pass.key(),
            plan_changed,
            parameters_changed
        );
        let result = client.update_instance(&request).await;
        self.ctx.metrics.record_osb_request("update", &result);

        match result {
            Ok(response) if response.is_async => {
                let status = pass.status();
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                if response.dashboard_url.is_some() {
                    status.dashboard_url = response.dashboard_url;
                }
                set_ready(status, false, REASON_UPDATING_INSTANCE, ASYNC_UPDATING_MESSAGE);
                self.poll(&pass.obj, client);
                Ok(Some(Action::await_change()))
            }
            Ok(response) => {
                info!("Updated ServiceInstance {}", pass.key());
                commit(
                    pass.status(),
                    ServiceInstanceOperation::Update,
                    update_requests,
                    response.dashboard_url,
                );
                Ok(Some(Action::await_change()))
            }
            Err(e) => {
                match ReconcileError::from_osb(
                    REASON_UPDATE_INSTANCE_CALL_FAILED,
                    "Error updating ServiceInstance",
                    &e,
                ) {
                    // An update the broker may have applied is simply sent again.
                    ReconcileError::Orphan { reason, message } => {
                        Err(ReconcileError::transient(reason, message))
                    }
                    err if err.is_terminal() => {
                        clear_operation(pass.status());
                        Err(err)
                    }
                    err => Err(err),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Deprovision
    // ------------------------------------------------------------------

    async fn deprovision(
        &self,
        pass: &mut Tracked<ServiceInstance>,
    ) -> Result<Option<Action>, ReconcileError> {
        let key = pass.key();
        if !has_finalizer(&pass.obj, FINALIZER_SERVICE_CATALOG) {
            self.ctx.poller.stop(&PollTarget::Instance(key));
            return Ok(None);
        }

        let status = pass.current();
        match status.deprovision_status {
            DeprovisionStatus::NotRequired | DeprovisionStatus::Succeeded => {
                return self.release(pass).await;
            }
            DeprovisionStatus::Failed => {
                debug!("Deprovision of ServiceInstance {} failed, finalizer stays", key);
                return Ok(Some(Action::await_change()));
            }
            DeprovisionStatus::Required => {}
        }

        let bindings = self.bindings_of(&pass.obj).await?;
        if !bindings.is_empty() {
            set_ready(
                pass.status(),
                false,
                REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS,
                &format!(
                    "All associated ServiceBindings must be removed before this ServiceInstance can be deleted: {}",
                    bindings.join(", ")
                ),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(REQUEUE_WHEN_WAITING_SECS))));
        }

        if self.retry_window_exceeded(&status, ServiceInstanceOperation::Deprovision) {
            let status = pass.status();
            clear_operation(status);
            status.deprovision_status = DeprovisionStatus::Failed;
            return Err(ReconcileError::validation(
                REASON_RECONCILIATION_RETRY_TIMEOUT,
                RETRY_TIMEOUT_MESSAGE,
            ));
        }

        let target = self.broker_view(&pass.obj, &status, false).await?;
        let (scope, broker) = instance_broker(&self.ctx, &pass.obj).await?;
        let client = client_for_broker_key(&self.ctx, scope, &broker).await?;

        let generation = pass.generation();
        begin_operation(
            pass.status(),
            ServiceInstanceOperation::Deprovision,
            None,
            generation,
            REASON_DEPROVISIONING,
            DEPROVISION_IN_FLIGHT_MESSAGE,
        );
        pass.save(self.store()).await?;

        info!("Deprovisioning ServiceInstance {}", key);
        let result = client
            .deprovision_instance(&deprovision_request(&pass.obj, &target))
            .await;
        self.ctx.metrics.record_osb_request("deprovision", &result);

        match result {
            Ok(response) if response.is_async => {
                let status = pass.status();
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                set_ready(status, false, REASON_DEPROVISIONING, ASYNC_DEPROVISIONING_MESSAGE);
                self.poll(&pass.obj, client);
                Ok(Some(Action::await_change()))
            }
            Ok(_) => {
                commit_deprovision(pass.status());
                self.release(pass).await
            }
            Err(e) => {
                let err = ReconcileError::from_osb(
                    REASON_DEPROVISION_CALL_FAILED,
                    "Error deprovisioning ServiceInstance",
                    &e,
                );
                if err.is_terminal() {
                    let status = pass.status();
                    clear_operation(status);
                    status.deprovision_status = DeprovisionStatus::Failed;
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
        pass: &mut Tracked<ServiceInstance>,
    ) -> Result<Option<Action>, ReconcileError> {
        pass.save(self.store()).await?;
        remove_finalizer(self.store(), &pass.obj, FINALIZER_SERVICE_CATALOG).await?;
        self.ctx.poller.stop(&PollTarget::Instance(pass.key()));
        info!("Released ServiceInstance {} for deletion", pass.key());
        Ok(None)
    }

    /// Names of the bindings in the instance's namespace that reference it.
    async fn bindings_of(&self, instance: &ServiceInstance) -> Result<Vec<String>, ReconcileError> {
        let name = instance.name_any();
        let bindings = self
            .ctx
            .stores
            .service_bindings
            .list(instance.namespace().as_deref(), None)
            .await?;
        Ok(bindings
            .into_iter()
            .filter(|b| b.spec.instance_ref.name == name)
            .map(|b| b.name_any())
            .collect())
    }

    // ------------------------------------------------------------------
    // Orphan mitigation
    // ------------------------------------------------------------------

    fn start_orphan_mitigation(&self, status: &mut ServiceInstanceStatus, message: &str) {
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.orphan_mitigation_in_progress = true;
        status.orphan_mitigation_attempts = 0;
        set_orphan_mitigation(status, true, REASON_STARTING_ORPHAN_MITIGATION, message);
        set_ready(status, false, REASON_STARTING_ORPHAN_MITIGATION, message);
        self.ctx.metrics.record_orphan_mitigation(KIND_SERVICE_INSTANCE);
    }

    async fn mitigate_orphan(
        &self,
        pass: &mut Tracked<ServiceInstance>,
    ) -> Result<Option<Action>, ReconcileError> {
        let status = pass.current();
        let limit = self.ctx.settings.orphan_mitigation_attempts;
        if status.orphan_mitigation_attempts >= limit {
            warn!("Orphan mitigation for ServiceInstance {} gave up after {} attempts", pass.key(), limit);
            fail_orphan_mitigation(
                pass.status(),
                &format!("Orphan mitigation failed after {limit} deprovision attempts"),
            );
            return Ok(Some(Action::await_change()));
        }

        let target = self.broker_view(&pass.obj, &status, true).await?;
        let (scope, broker) = instance_broker(&self.ctx, &pass.obj).await?;
        let client = client_for_broker_key(&self.ctx, scope, &broker).await?;

        let attempt = status.orphan_mitigation_attempts + 1;
        info!("Orphan mitigation for ServiceInstance {}: deprovision attempt {}", pass.key(), attempt);
        let result = client
            .deprovision_instance(&deprovision_request(&pass.obj, &target))
            .await;
        self.ctx.metrics.record_osb_request("deprovision", &result);

        let status = pass.status();
        match result {
            Ok(response) if response.is_async => {
                status.current_operation = Some(ServiceInstanceOperation::Deprovision);
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                self.poll(&pass.obj, client);
                Ok(Some(Action::await_change()))
            }
            Ok(_) => {
                finish_orphan_mitigation(status);
                Ok(Some(Action::await_change()))
            }
            Err(e) => {
                status.orphan_mitigation_attempts = attempt;
                set_ready(
                    status,
                    false,
                    REASON_DEPROVISION_CALL_FAILED,
                    &format!("Orphan mitigation deprovision attempt {attempt} failed: {}", e.summary()),
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
        pass: &mut Tracked<ServiceInstance>,
    ) -> Result<Option<Action>, ReconcileError> {
        let key = pass.key();
        let target = PollTarget::Instance(key.clone());
        let status = pass.current();
        let Some(operation) = status.current_operation else {
            warn!("ServiceInstance {} has an async operation but no current operation", key);
            let status = pass.status();
            status.async_op_in_progress = false;
            status.last_operation = None;
            return Ok(Some(Action::requeue(Duration::ZERO)));
        };

        let Some(outcome) = self.ctx.poller.take_outcome(&target) else {
            if !self.ctx.poller.is_polling(&target) {
                let (scope, broker) = instance_broker(&self.ctx, &pass.obj).await?;
                let client = client_for_broker_key(&self.ctx, scope, &broker).await?;
                self.poll(&pass.obj, client);
            }
            return Ok(Some(Action::await_change()));
        };
        debug!("Poll outcome for ServiceInstance {}: {:?}", key, outcome);

        let update_requests = pass.obj.spec.update_requests;
        let mitigating = status.orphan_mitigation_in_progress;
        let status = pass.status();
        match (operation, outcome) {
            (_, PollOutcome::InProgress { description }) => {
                let (reason, fallback) = match operation {
                    ServiceInstanceOperation::Provision => (REASON_PROVISIONING, ASYNC_PROVISIONING_MESSAGE),
                    ServiceInstanceOperation::Update => (REASON_UPDATING_INSTANCE, ASYNC_UPDATING_MESSAGE),
                    ServiceInstanceOperation::Deprovision => {
                        (REASON_DEPROVISIONING, ASYNC_DEPROVISIONING_MESSAGE)
                    }
                };
                set_ready(status, false, reason, description.as_deref().unwrap_or(fallback));
                Ok(Some(Action::await_change()))
            }

            (
                ServiceInstanceOperation::Provision | ServiceInstanceOperation::Update,
                PollOutcome::Succeeded { .. },
            ) => {
                info!("Asynchronous {:?} of ServiceInstance {} succeeded", operation, key);
                commit(status, operation, update_requests, None);
                Ok(Some(Action::await_change()))
            }

            (ServiceInstanceOperation::Provision, PollOutcome::Gone) => {
                status.deprovision_status = DeprovisionStatus::NotRequired;
                status.reconciled_generation = status.observed_generation;
                clear_operation(status);
                set_failed(
                    status,
                    REASON_PROVISION_CALL_FAILED,
                    "The broker no longer knows the instance being provisioned",
                );
                Ok(Some(Action::await_change()))
            }

            (ServiceInstanceOperation::Provision, PollOutcome::Failed { description }) => {
                let message = format!(
                    "Asynchronous provision failed: {}",
                    description.as_deref().unwrap_or("no description")
                );
                warn!("ServiceInstance {}: {}", key, message);
                self.start_orphan_mitigation(status, &message);
                Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
            }

            (ServiceInstanceOperation::Provision, PollOutcome::Error(e)) => {
                let message = format!("Error polling last operation: {}", e.summary());
                self.start_orphan_mitigation(status, &message);
                Ok(Some(Action::requeue(orphan_mitigation_delay(0))))
            }

            (ServiceInstanceOperation::Update, outcome) => {
                let message = match outcome {
                    PollOutcome::Failed { description } => format!(
                        "Asynchronous update failed: {}",
                        description.as_deref().unwrap_or("no description")
                    ),
                    PollOutcome::Error(e) => format!("Error polling last operation: {}", e.summary()),
                    _ => "The broker no longer knows the instance being updated".to_string(),
                };
                status.reconciled_generation = status.observed_generation;
                clear_operation(status);
                set_failed(status, REASON_UPDATE_INSTANCE_CALL_FAILED, &message);
                Ok(Some(Action::await_change()))
            }

            (
                ServiceInstanceOperation::Deprovision,
                PollOutcome::Succeeded { .. } | PollOutcome::Gone,
            ) => {
                if mitigating {
                    finish_orphan_mitigation(status);
                    return Ok(Some(Action::await_change()));
                }
                commit_deprovision(status);
                if pass.obj.is_being_deleted() {
                    return self.release(pass).await;
                }
                Ok(Some(Action::await_change()))
            }

            (ServiceInstanceOperation::Deprovision, outcome) => {
                let (reason, message) = match outcome {
                    PollOutcome::Error(e) => (
                        REASON_POLL_LAST_OPERATION_ERROR,
                        format!("Error polling last operation: {}", e.summary()),
                    ),
                    PollOutcome::Failed { description } => (
                        REASON_DEPROVISION_CALL_FAILED,
                        format!(
                            "Asynchronous deprovision failed: {}",
                            description.as_deref().unwrap_or("no description")
                        ),
                    ),
                    _ => (REASON_DEPROVISION_CALL_FAILED, String::new()),
                };
                status.async_op_in_progress = false;
                status.last_operation = None;
                if mitigating {
                    status.orphan_mitigation_attempts += 1;
                    let attempt = status.orphan_mitigation_attempts;
                    set_ready(status, false, REASON_DEPROVISION_CALL_FAILED, &message);
                    return Ok(Some(Action::requeue(orphan_mitigation_delay(attempt))));
                }
                clear_operation(status);
                status.deprovision_status = DeprovisionStatus::Failed;
                status.reconciled_generation = status.observed_generation;
                set_failed(status, reason, &message);
                Ok(Some(Action::await_change()))
            }
        }
    }

    /// Start (or keep) polling the operation recorded in the instance status.
    fn poll(&self, instance: &ServiceInstance, client: Arc<dyn BrokerClient>) {
        let status = instance.status.clone().unwrap_or_default();
        let view = status
            .in_progress_properties
            .as_ref()
            .or(status.external_properties.as_ref())
            .cloned()
            .unwrap_or_default();
        let request = LastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            binding_id: None,
            service_id: Some(view.class_external_id).filter(|s| !s.is_empty()),
            plan_id: Some(view.plan_external_id).filter(|s| !s.is_empty()),
            operation_key: status.last_operation.clone(),
            originating_identity: originating_identity(instance.spec.user_info.as_ref()),
        };
        self.ctx.poller.start(
            PollTarget::Instance(ObjectKey::of(instance)),
            client,
            request,
            self.ctx.queues.service_instances.clone(),
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn retry_window_exceeded(
        &self,
        status: &ServiceInstanceStatus,
        operation: ServiceInstanceOperation,
    ) -> bool {
        status.current_operation == Some(operation)
            && retry_window_expired(
                status.operation_start_time.as_deref(),
                self.ctx.settings.reconciliation_retry_duration,
            )
    }

    /// Abandon a provision or update that kept failing for too long.
    fn check_retry_window(
        &self,
        pass: &mut Tracked<ServiceInstance>,
        operation: ServiceInstanceOperation,
    ) -> Result<(), ReconcileError> {
        if !self.retry_window_exceeded(&pass.current(), operation) {
            return Ok(());
        }
        warn!("Giving up on {:?} of ServiceInstance {}", operation, pass.key());
        clear_operation(pass.status());
        Err(ReconcileError::validation(
            REASON_RECONCILIATION_RETRY_TIMEOUT,
            RETRY_TIMEOUT_MESSAGE,
        ))
    }

    async fn resolve_parameters(
        &self,
        instance: &ServiceInstance,
        entry: &CatalogEntry,
    ) -> Result<ResolvedParameters, ReconcileError> {
        let namespace = instance.namespace().unwrap_or_default();
        let defaults = [
            entry.class.default_provision_parameters.as_ref(),
            entry.plan.default_provision_parameters.as_ref(),
        ];
        let sources = ParameterSources {
            namespace: &namespace,
            inline: instance.spec.parameters.as_ref(),
            parameters_from: &instance.spec.parameters_from,
            defaults: &defaults,
        };
        Ok(build_parameters(&self.ctx.stores.secrets, sources).await?)
    }

    /// Service and plan IDs the broker knows the instance by.
    ///
    /// Orphan mitigation prefers the properties of the failed attempt; a regular
    /// deprovision prefers what the broker last confirmed.
    async fn broker_view(
        &self,
        instance: &ServiceInstance,
        status: &ServiceInstanceStatus,
        prefer_in_progress: bool,
    ) -> Result<ServiceInstancePropertiesState, ReconcileError> {
        let (first, second) = if prefer_in_progress {
            (&status.in_progress_properties, &status.external_properties)
        } else {
            (&status.external_properties, &status.in_progress_properties)
        };
        if let Some(view) = first.as_ref().or(second.as_ref()) {
            return Ok(view.clone());
        }
        let entry = load_catalog_entry(&self.ctx, instance).await?;
        Ok(ServiceInstancePropertiesState {
            class_external_id: entry.class.external_id,
            plan_external_name: entry.plan.external_name,
            plan_external_id: entry.plan.external_id,
            ..ServiceInstancePropertiesState::default()
        })
    }
}

fn properties(
    entry: &CatalogEntry,
    parameters: &ResolvedParameters,
    instance: &ServiceInstance,
) -> ServiceInstancePropertiesState {
    ServiceInstancePropertiesState {
        class_external_id: entry.class.external_id.clone(),
        plan_external_name: entry.plan.external_name.clone(),
        plan_external_id: entry.plan.external_id.clone(),
        parameters: parameters.for_status(),
        parameter_checksum: parameters.checksum.clone(),
        user_info: instance.spec.user_info.clone(),
    }
}

/// Class defaults overlaid with plan defaults, as recorded in status.
fn merged_defaults(entry: &CatalogEntry) -> Option<Value> {
    let mut merged = serde_json::Map::new();
    for defaults in [
        &entry.class.default_provision_parameters,
        &entry.plan.default_provision_parameters,
    ] {
        if let Some(Value::Object(object)) = defaults {
            merged.extend(object.clone());
        }
    }
    (!merged.is_empty()).then_some(Value::Object(merged))
}

fn deprovision_request(
    instance: &ServiceInstance,
    view: &ServiceInstancePropertiesState,
) -> DeprovisionRequest {
    DeprovisionRequest {
        instance_id: instance.spec.external_id.clone(),
        accepts_incomplete: true,
        service_id: view.class_external_id.clone(),
        plan_id: view.plan_external_id.clone(),
        originating_identity: originating_identity(instance.spec.user_info.as_ref()),
    }
}

/// Record the start of an operation; the start time survives retries of the same operation.
fn begin_operation(
    status: &mut ServiceInstanceStatus,
    operation: ServiceInstanceOperation,
    properties: Option<ServiceInstancePropertiesState>,
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

fn clear_operation(status: &mut ServiceInstanceStatus) {
    status.current_operation = None;
    status.operation_start_time = None;
    status.in_progress_properties = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
}

/// Record a successful provision or update.
fn commit(
    status: &mut ServiceInstanceStatus,
    operation: ServiceInstanceOperation,
    update_requests: i64,
    dashboard_url: Option<String>,
) {
    let (reason, message) = if operation == ServiceInstanceOperation::Provision {
        status.provision_status = ServiceInstanceProvisionStatus::Provisioned;
        (REASON_PROVISIONED_SUCCESSFULLY, PROVISIONED_MESSAGE)
    } else {
        (REASON_INSTANCE_UPDATED_SUCCESSFULLY, UPDATED_MESSAGE)
    };
    status.external_properties = status.in_progress_properties.take();
    clear_operation(status);
    status.reconciled_generation = status.observed_generation;
    status.observed_update_requests = update_requests;
    if dashboard_url.is_some() {
        status.dashboard_url = dashboard_url;
    }
    set_ready(status, true, reason, message);
}

fn commit_deprovision(status: &mut ServiceInstanceStatus) {
    clear_operation(status);
    status.deprovision_status = DeprovisionStatus::Succeeded;
    status.provision_status = ServiceInstanceProvisionStatus::NotProvisioned;
    status.external_properties = None;
    status.orphan_mitigation_in_progress = false;
    set_orphan_mitigation(status, false, "", "");
    set_ready(status, false, REASON_DEPROVISIONED_SUCCESSFULLY, DEPROVISIONED_MESSAGE);
}

/// The broker's copy of a failed provision is gone; the provision itself still failed.
fn finish_orphan_mitigation(status: &mut ServiceInstanceStatus) {
    clear_operation(status);
    status.orphan_mitigation_in_progress = false;
    status.deprovision_status = DeprovisionStatus::Succeeded;
    status.reconciled_generation = status.observed_generation;
    set_orphan_mitigation(status, false, "", "");
    set_failed(
        status,
        REASON_PROVISION_CALL_FAILED,
        "Provision failed; orphan mitigation removed the instance from the broker",
    );
}

fn fail_orphan_mitigation(status: &mut ServiceInstanceStatus, message: &str) {
    clear_operation(status);
    status.orphan_mitigation_in_progress = false;
    status.deprovision_status = DeprovisionStatus::Failed;
    status.reconciled_generation = status.observed_generation;
    set_orphan_mitigation(status, false, "", "");
    set_failed(status, REASON_ORPHAN_MITIGATION_FAILED, message);
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod instance_tests;
