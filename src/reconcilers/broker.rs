// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Broker catalog reconciliation.
//!
//! One pass fetches the broker catalog and makes the class and plan entities of
//! that broker match it:
//!
//! 1. Accepted services and plans are created, or updated in place
//! 2. Entities that left the catalog (or no longer pass `catalogRestrictions`)
//!    are deleted, unless an instance still uses them, in which case they are
//!    flagged `removedFromBrokerCatalog`
//!
//! The catalog is fetched again on a spec change, while the broker is not
//! ready, and every relist interval in `Duration` mode.

use super::finalizers::{ensure_finalizer, has_finalizer, remove_finalizer};
use super::references::{instance_uses_class, instance_uses_plan};
use super::status::{is_ready, set_ready};
use super::{
    broker_client_for, elapsed_since, failed_for_generation, finish_pass, now_rfc3339,
    HasStatusField, ReconcileError, Tracked,
};
use crate::constants::{KIND_CLUSTER_SERVICE_BROKER, KIND_SERVICE_BROKER, REQUEUE_WHEN_WAITING_SECS};
use crate::context::{Context, Settings};
use crate::crd::{
    BrokerResource, CatalogScope, ClassResource, CommonServiceBrokerSpec, CommonServiceClassSpec,
    CommonServicePlanSpec, PlanResource, RelistBehavior, ServiceBrokerStatus, ServiceInstance,
};
use crate::dispatcher::{Action, Reconciler};
use crate::duration::parse_positive_duration;
use crate::filter::CatalogPredicate;
use crate::labels::{
    hashed_label_value, FINALIZER_SERVICE_CATALOG, K8S_MANAGED_BY, K8S_PART_OF,
    LABEL_EXTERNAL_ID, LABEL_EXTERNAL_NAME, MANAGED_BY_BROKER_CONTROLLER, PART_OF_SVCAT,
};
use crate::osb::{Catalog, Plan, Service};
use crate::status_reasons::{
    REASON_AUTH_FAILED, REASON_CATALOG_FETCH_FAILED, REASON_CATALOG_IN_USE,
    REASON_CATALOG_SYNC_FAILED, REASON_FETCHED_CATALOG, REASON_INVALID_CATALOG,
    REASON_INVALID_CATALOG_RESTRICTIONS, REASON_INVALID_RELIST_DURATION,
};
use crate::store::{ObjectKey, SharedStore, StoreError, Stored};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FETCHED_CATALOG_MESSAGE: &str = "Successfully fetched catalog entries from broker.";

/// Reconciles `ClusterServiceBroker` or `ServiceBroker`, depending on `B`.
pub struct BrokerReconciler<B> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> B>,
}

impl<B> BrokerReconciler<B> {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<B> Reconciler for BrokerReconciler<B>
where
    B: BrokerResource + HasStatusField<Status = ServiceBrokerStatus>,
{
    fn kind(&self) -> &'static str {
        broker_kind::<B>()
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let store = B::store(&self.ctx.stores);
        let broker = match store.get(key).await {
            Ok(broker) => broker,
            Err(e) if e.is_not_found() => {
                debug!("{} {} no longer exists", broker_kind::<B>(), key);
                self.ctx.clients.remove(key);
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let mut pass = Tracked::new(broker);
        let result = self.step(&mut pass).await;
        finish_pass(&mut pass, store, result).await
    }
}

fn broker_kind<B: BrokerResource>() -> &'static str {
    match B::SCOPE {
        CatalogScope::Cluster => KIND_CLUSTER_SERVICE_BROKER,
        CatalogScope::Namespaced => KIND_SERVICE_BROKER,
    }
}

impl<B> BrokerReconciler<B>
where
    B: BrokerResource + HasStatusField<Status = ServiceBrokerStatus>,
{
    async fn step(&self, pass: &mut Tracked<B>) -> Result<Option<Action>, ReconcileError> {
        let store = B::store(&self.ctx.stores);
        if pass.obj.meta().deletion_timestamp.is_some() {
            return self.finalize(pass).await;
        }
        if !has_finalizer(&pass.obj, FINALIZER_SERVICE_CATALOG) {
            let written = ensure_finalizer(store, &pass.obj, FINALIZER_SERVICE_CATALOG).await?;
            pass.adopt(written);
        }

        let generation = pass.generation();
        let status = pass.current();
        if failed_for_generation(&status, generation) {
            return Ok(Some(Action::await_change()));
        }

        let interval = relist_interval(pass.obj.common_spec(), &self.ctx.settings)?;
        let elapsed = elapsed_since(status.last_catalog_retrieval_time.as_deref(), Utc::now());
        let due = elapsed.is_none() || status.reconciled_generation != generation || !is_ready(&status);
        if let (false, Some(elapsed)) = (due, elapsed) {
            match interval {
                None => return Ok(Some(Action::await_change())),
                Some(interval) if elapsed < interval => {
                    return Ok(Some(Action::requeue(interval - elapsed)));
                }
                Some(_) => {}
            }
        }

        self.sync_catalog(pass).await?;

        let status = pass.status();
        set_ready(status, true, REASON_FETCHED_CATALOG, FETCHED_CATALOG_MESSAGE);
        status.last_catalog_retrieval_time = Some(now_rfc3339());
        status.reconciled_generation = generation;
        Ok(Some(interval.map_or_else(Action::await_change, Action::requeue)))
    }

    async fn sync_catalog(&self, pass: &Tracked<B>) -> Result<(), ReconcileError> {
        let broker = &pass.obj;
        let key = pass.key();
        let predicate = CatalogPredicate::compile(
            broker.common_spec().catalog_restrictions.as_ref(),
            B::SCOPE,
        )
        .map_err(|e| {
            ReconcileError::validation(
                REASON_INVALID_CATALOG_RESTRICTIONS,
                format!("Invalid catalogRestrictions: {e}"),
            )
        })?;

        let client = broker_client_for(&self.ctx, broker).await?;
        info!("Fetching catalog from {} {}", broker_kind::<B>(), key);
        let result = client.get_catalog().await;
        self.ctx.metrics.record_osb_request("get_catalog", &result);
        let catalog = result.map_err(|e| {
            let reason = if e.is_auth_failure() {
                REASON_AUTH_FAILED
            } else {
                REASON_CATALOG_FETCH_FAILED
            };
            ReconcileError::transient(reason, format!("Error getting broker catalog: {}", e.summary()))
        })?;
        validate_catalog(&catalog)?;

        apply_catalog(&self.ctx, broker, &catalog, &predicate)
            .await
            .map_err(|e| {
                ReconcileError::transient(
                    REASON_CATALOG_SYNC_FAILED,
                    format!("Error syncing catalog from {} {key}: {e}", broker_kind::<B>()),
                )
            })
    }

    async fn finalize(&self, pass: &mut Tracked<B>) -> Result<Option<Action>, ReconcileError> {
        let key = pass.key();
        if !has_finalizer(&pass.obj, FINALIZER_SERVICE_CATALOG) {
            self.ctx.clients.remove(&key);
            return Ok(None);
        }

        let namespace = pass.obj.namespace();
        let broker_name = pass.obj.name_any();
        let classes: Vec<B::Class> = list_owned(
            &self.ctx,
            namespace.as_deref(),
            <B::Class as ClassResource>::BROKER_NAME_LABEL,
            &broker_name,
        )
        .await?;
        let instances = self
            .ctx
            .stores
            .service_instances
            .list(namespace.as_deref(), None)
            .await?;
        let in_use: Vec<String> = classes
            .iter()
            .map(ResourceExt::name_any)
            .filter(|name| instances.iter().any(|i| instance_uses_class(i, B::SCOPE, name)))
            .collect();
        if !in_use.is_empty() {
            info!(
                "{} {} is being deleted but classes {} are still in use",
                broker_kind::<B>(),
                key,
                in_use.join(", ")
            );
            set_ready(
                pass.status(),
                false,
                REASON_CATALOG_IN_USE,
                &format!(
                    "Cannot remove the catalog while service instances use classes {}",
                    in_use.join(", ")
                ),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(REQUEUE_WHEN_WAITING_SECS))));
        }

        info!("Deleting catalog of {} {}", broker_kind::<B>(), key);
        let plans: Vec<B::Plan> = list_owned(
            &self.ctx,
            namespace.as_deref(),
            <B::Plan as PlanResource>::BROKER_NAME_LABEL,
            &broker_name,
        )
        .await?;
        for plan in &plans {
            delete_entity(<B::Plan as Stored>::store(&self.ctx.stores), plan).await?;
        }
        for class in &classes {
            delete_entity(<B::Class as Stored>::store(&self.ctx.stores), class).await?;
        }

        remove_finalizer(B::store(&self.ctx.stores), &pass.obj, FINALIZER_SERVICE_CATALOG).await?;
        self.ctx.clients.remove(&key);
        Ok(None)
    }
}

/// Relist interval of a broker; `None` in `Manual` mode.
///
/// # Errors
///
/// `Validation(ErrorInvalidRelistDuration)` when `relistDuration` does not parse
/// or is not positive.
pub fn relist_interval(
    spec: &CommonServiceBrokerSpec,
    settings: &Settings,
) -> Result<Option<Duration>, ReconcileError> {
    match spec.relist_behavior {
        RelistBehavior::Manual => Ok(None),
        RelistBehavior::Duration => match spec.relist_duration.as_deref() {
            None | Some("") => Ok(Some(settings.default_relist_interval)),
            Some(raw) => parse_positive_duration(raw).map(Some).map_err(|e| {
                ReconcileError::validation(
                    REASON_INVALID_RELIST_DURATION,
                    format!("Invalid relistDuration {raw:?}: {e}"),
                )
            }),
        },
    }
}

/// Reject catalogs that cannot be mapped onto entities.
///
/// # Errors
///
/// `Transient(InvalidCatalog)` for a missing ID or name, a service without plans
/// or an ID used twice.
pub fn validate_catalog(catalog: &Catalog) -> Result<(), ReconcileError> {
    let invalid = |message: String| ReconcileError::transient(REASON_INVALID_CATALOG, message);
    let mut class_ids = HashSet::new();
    let mut plan_ids = HashSet::new();
    for service in &catalog.services {
        if service.id.is_empty() || service.name.is_empty() {
            return Err(invalid(format!(
                "service {:?} must have both an id and a name",
                service.name
            )));
        }
        if !class_ids.insert(service.id.as_str()) {
            return Err(invalid(format!("service id {:?} appears twice", service.id)));
        }
        if service.plans.is_empty() {
            return Err(invalid(format!("service {:?} has no plans", service.name)));
        }
        for plan in &service.plans {
            if plan.id.is_empty() || plan.name.is_empty() {
                return Err(invalid(format!(
                    "plan {:?} of service {:?} must have both an id and a name",
                    plan.name, service.name
                )));
            }
            if !plan_ids.insert(plan.id.as_str()) {
                return Err(invalid(format!("plan id {:?} appears twice", plan.id)));
            }
        }
    }
    Ok(())
}

#[must_use]
pub fn class_spec(service: &Service) -> CommonServiceClassSpec {
    CommonServiceClassSpec {
        external_name: service.name.clone(),
        external_id: service.id.clone(),
        description: service.description.clone(),
        bindable: service.bindable,
        binding_retrievable: service.bindings_retrievable,
        instances_retrievable: service.instances_retrievable,
        plan_updatable: service.plan_updatable,
        external_metadata: service.metadata.clone(),
        tags: service.tags.clone(),
        requires: service.requires.clone(),
        default_provision_parameters: None,
    }
}

#[must_use]
pub fn plan_spec(plan: &Plan) -> CommonServicePlanSpec {
    CommonServicePlanSpec {
        external_name: plan.name.clone(),
        external_id: plan.id.clone(),
        description: plan.description.clone(),
        bindable: plan.bindable,
        free: plan.free.unwrap_or(true),
        external_metadata: plan.metadata.clone(),
        instance_create_parameter_schema: plan.instance_create_schema().cloned(),
        instance_update_parameter_schema: plan.instance_update_schema().cloned(),
        service_binding_create_parameter_schema: plan.binding_create_schema().cloned(),
        default_provision_parameters: None,
    }
}

/// Kube name for an entity created from a broker catalog.
#[must_use]
pub fn entity_name(broker: &ObjectKey, external_id: &str) -> String {
    hashed_label_value(&format!("{broker}/{external_id}"))
}

pub(crate) fn class_labels<C: ClassResource>(
    broker_name: &str,
    spec: &CommonServiceClassSpec,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_EXTERNAL_ID.to_string(), hashed_label_value(&spec.external_id)),
        (LABEL_EXTERNAL_NAME.to_string(), hashed_label_value(&spec.external_name)),
        (C::BROKER_NAME_LABEL.to_string(), hashed_label_value(broker_name)),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_BROKER_CONTROLLER.to_string()),
        (K8S_PART_OF.to_string(), PART_OF_SVCAT.to_string()),
    ])
}

pub(crate) fn plan_labels<P: PlanResource>(
    broker_name: &str,
    class_name: &str,
    spec: &CommonServicePlanSpec,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_EXTERNAL_ID.to_string(), hashed_label_value(&spec.external_id)),
        (LABEL_EXTERNAL_NAME.to_string(), hashed_label_value(&spec.external_name)),
        (P::BROKER_NAME_LABEL.to_string(), hashed_label_value(broker_name)),
        (P::CLASS_NAME_LABEL.to_string(), hashed_label_value(class_name)),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_BROKER_CONTROLLER.to_string()),
        (K8S_PART_OF.to_string(), PART_OF_SVCAT.to_string()),
    ])
}

fn entity_meta(
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace,
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

/// Entities of kind `K` whose `label` carries the hashed `broker_name`.
async fn list_owned<K: Stored>(
    ctx: &Context,
    namespace: Option<&str>,
    label: &str,
    broker_name: &str,
) -> Result<Vec<K>, StoreError> {
    let selector = format!("{label}={}", hashed_label_value(broker_name));
    K::store(&ctx.stores).list(namespace, Some(&selector)).await
}

async fn delete_entity<K: Stored>(store: &SharedStore<K>, entity: &K) -> Result<(), StoreError> {
    let key = ObjectKey::of(entity);
    debug!("Deleting {} {}", K::kind(&()), key);
    match store.delete(&key, &DeleteParams::default()).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

fn labels_cover(current: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| current.get(k) == Some(v))
}

async fn upsert_class<C: ClassResource>(
    store: &SharedStore<C>,
    existing: Option<C>,
    candidate: C,
) -> Result<C, StoreError> {
    let Some(mut current) = existing else {
        debug!("Creating {} {}", C::kind(&()), candidate.name_any());
        return store.create(&candidate).await;
    };
    let mut spec = candidate.common_spec().clone();
    spec.default_provision_parameters = current.common_spec().default_provision_parameters.clone();
    if current.common_spec() != &spec
        || current.broker_name() != candidate.broker_name()
        || !labels_cover(current.labels(), candidate.labels())
    {
        *current.common_spec_mut() = spec;
        current.labels_mut().extend(candidate.labels().clone());
        current = store.replace(&current).await?;
    }
    if current.removed_from_broker_catalog() {
        current.set_removed_from_broker_catalog(false);
        current = store.replace_status(&current).await?;
    }
    Ok(current)
}

async fn upsert_plan<P: PlanResource>(
    store: &SharedStore<P>,
    existing: Option<P>,
    candidate: P,
) -> Result<P, StoreError> {
    let Some(mut current) = existing else {
        debug!("Creating {} {}", P::kind(&()), candidate.name_any());
        return store.create(&candidate).await;
    };
    let mut spec = candidate.common_spec().clone();
    spec.default_provision_parameters = current.common_spec().default_provision_parameters.clone();
    if current.common_spec() != &spec
        || current.class_name() != candidate.class_name()
        || !labels_cover(current.labels(), candidate.labels())
    {
        // The class reference is immutable once set, so a moved plan is recreated.
        if current.class_name() != candidate.class_name() {
            delete_entity(store, &current).await?;
            return store.create(&candidate).await;
        }
        *current.common_spec_mut() = spec;
        current.labels_mut().extend(candidate.labels().clone());
        current = store.replace(&current).await?;
    }
    if current.removed_from_broker_catalog() {
        current.set_removed_from_broker_catalog(false);
        current = store.replace_status(&current).await?;
    }
    Ok(current)
}

/// Make the class and plan entities of `broker` match `catalog`.
async fn apply_catalog<B: BrokerResource>(
    ctx: &Context,
    broker: &B,
    catalog: &Catalog,
    predicate: &CatalogPredicate,
) -> Result<(), StoreError> {
    let broker_name = broker.name_any();
    let broker_key = ObjectKey::of(broker);
    let namespace = broker.namespace();
    let owner = broker.controller_owner_ref(&());
    let class_store = <B::Class as Stored>::store(&ctx.stores);
    let plan_store = <B::Plan as Stored>::store(&ctx.stores);

    let mut classes_by_id: HashMap<String, B::Class> =
        list_owned::<B::Class>(
            ctx,
            namespace.as_deref(),
            <B::Class as ClassResource>::BROKER_NAME_LABEL,
            &broker_name,
        )
            .await?
            .into_iter()
            .map(|c| (c.common_spec().external_id.clone(), c))
            .collect();
    let mut plans_by_id: HashMap<String, B::Plan> =
        list_owned::<B::Plan>(
            ctx,
            namespace.as_deref(),
            <B::Plan as PlanResource>::BROKER_NAME_LABEL,
            &broker_name,
        )
            .await?
            .into_iter()
            .map(|p| (p.common_spec().external_id.clone(), p))
            .collect();

    let mut accepted_classes = 0;
    let mut accepted_plans = 0;
    for service in &catalog.services {
        let spec = class_spec(service);
        let name = classes_by_id
            .get(&service.id)
            .map_or_else(|| entity_name(&broker_key, &service.id), ResourceExt::name_any);
        let labels = class_labels::<B::Class>(&broker_name, &spec);
        let candidate = B::Class::from_catalog(
            entity_meta(name, namespace.clone(), labels, owner.clone()),
            &broker_name,
            spec,
        );
        if !predicate.accepts_class(&candidate) {
            debug!("Class {:?} of {} rejected by catalogRestrictions", service.name, broker_key);
            continue;
        }
        let class = upsert_class(class_store, classes_by_id.remove(&service.id), candidate).await?;
        let class_name = class.name_any();
        accepted_classes += 1;

        for plan in &service.plans {
            let spec = plan_spec(plan);
            let name = plans_by_id
                .get(&plan.id)
                .map_or_else(|| entity_name(&broker_key, &plan.id), ResourceExt::name_any);
            let labels = plan_labels::<B::Plan>(&broker_name, &class_name, &spec);
            let candidate = B::Plan::from_catalog(
                entity_meta(name, namespace.clone(), labels, owner.clone()),
                &broker_name,
                &class_name,
                spec,
            );
            if !predicate.accepts_plan(&candidate) {
                debug!("Plan {:?} of {} rejected by catalogRestrictions", plan.name, broker_key);
                continue;
            }
            upsert_plan(plan_store, plans_by_id.remove(&plan.id), candidate).await?;
            accepted_plans += 1;
        }
    }

    let instances: Vec<ServiceInstance> = ctx
        .stores
        .service_instances
        .list(namespace.as_deref(), None)
        .await?;
    for mut plan in plans_by_id.into_values() {
        let name = plan.name_any();
        if instances.iter().any(|i| instance_uses_plan(i, B::SCOPE, &name)) {
            if !plan.removed_from_broker_catalog() {
                warn!("Plan {} of {} left the catalog but is still in use", name, broker_key);
                plan.set_removed_from_broker_catalog(true);
                plan_store.replace_status(&plan).await?;
            }
        } else {
            delete_entity(plan_store, &plan).await?;
        }
    }
    for mut class in classes_by_id.into_values() {
        let name = class.name_any();
        if instances.iter().any(|i| instance_uses_class(i, B::SCOPE, &name)) {
            if !class.removed_from_broker_catalog() {
                warn!("Class {} of {} left the catalog but is still in use", name, broker_key);
                class.set_removed_from_broker_catalog(true);
                class_store.replace_status(&class).await?;
            }
        } else {
            delete_entity(class_store, &class).await?;
        }
    }

    info!(
        "Synced catalog of {}: {} classes and {} plans accepted",
        broker_key, accepted_classes, accepted_plans
    );
    Ok(())
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod broker_tests;
