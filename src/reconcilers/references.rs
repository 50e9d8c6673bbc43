// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Class and plan resolution for service instances.
//!
//! An instance names its class and plan in one of six ways (see
//! [`PlanReference`]). Resolution turns that into the kube names of the catalog
//! entities and writes them to `spec.{cluster,}ServiceClassRef` and
//! `spec.{cluster,}ServicePlanRef`. The class is resolved once; the plan is
//! resolved again whenever the user points the instance at a different plan.
//!
//! Lookups by external name or ID use the hashed labels the broker reconciler
//! puts on every entity, then compare the raw spec field.

use super::{ReconcileError, Tracked};
use crate::context::Context;
use crate::crd::{
    Addressing, CatalogScope, ClassResource, ClusterServiceClass, ClusterServicePlan,
    CommonServiceClassSpec, CommonServicePlanSpec, LocalObjectReference, PlanReference,
    PlanResource, ServiceClass, ServiceInstance, ServicePlan,
};
use crate::labels::{hashed_label_value, LABEL_EXTERNAL_ID, LABEL_EXTERNAL_NAME};
use crate::status_reasons::{
    REASON_INVALID_PLAN_REFERENCE, REASON_NONEXISTENT_CLASS, REASON_PLAN_NOT_FOUND,
};
use crate::store::{ObjectKey, Stored};
use kube::ResourceExt;
use tracing::{debug, info};

/// Everything a broker call needs to know about an instance's class and plan.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub scope: CatalogScope,
    /// Broker that owns the class.
    pub broker: ObjectKey,
    pub class_name: String,
    pub plan_name: String,
    pub class: CommonServiceClassSpec,
    pub plan: CommonServicePlanSpec,
    pub class_removed: bool,
    pub plan_removed: bool,
}

/// Parse the instance's plan reference.
///
/// # Errors
///
/// `Validation(ErrorInvalidPlanReference)` when the fields do not name exactly one mode.
pub fn plan_reference(instance: &ServiceInstance) -> Result<PlanReference, ReconcileError> {
    PlanReference::try_from(&instance.spec.plan_reference).map_err(|e| {
        ReconcileError::validation(
            REASON_INVALID_PLAN_REFERENCE,
            format!("Invalid plan reference: {e}"),
        )
    })
}

/// Resolve class and plan references and write them to the instance spec.
///
/// No write happens when the recorded references already match.
///
/// # Errors
///
/// Validation errors for malformed or ambiguous references, transient errors
/// while the referenced entities do not exist yet.
pub async fn ensure_references(
    ctx: &Context,
    pass: &mut Tracked<ServiceInstance>,
) -> Result<(), ReconcileError> {
    let reference = plan_reference(&pass.obj)?;
    let (class_name, plan_name) = match reference.scope() {
        CatalogScope::Cluster => {
            resolve::<ClusterServiceClass, ClusterServicePlan>(ctx, &pass.obj, &reference).await?
        }
        CatalogScope::Namespaced => {
            resolve::<ServiceClass, ServicePlan>(ctx, &pass.obj, &reference).await?
        }
    };

    let status = pass.status();
    status.user_specified_class_name = Some(user_specified_class(&reference));
    status.user_specified_plan_name = Some(user_specified_plan(&reference));

    let (class_ref, plan_ref) = refs_for_scope(&pass.obj, reference.scope());
    if class_ref == Some(class_name.as_str()) && plan_ref == Some(plan_name.as_str()) {
        return Ok(());
    }

    info!(
        "Resolved {} for ServiceInstance {} to class {} and plan {}",
        reference,
        pass.key(),
        class_name,
        plan_name
    );
    let mut updated = pass.obj.clone();
    set_refs(&mut updated, reference.scope(), class_name, plan_name);
    let written = ctx.stores.service_instances.replace(&updated).await?;
    pass.adopt(written);
    Ok(())
}

fn user_specified_class(reference: &PlanReference) -> String {
    let kind = match reference.scope() {
        CatalogScope::Cluster => "ClusterServiceClass",
        CatalogScope::Namespaced => "ServiceClass",
    };
    format!("{kind}/{}", reference.class())
}

fn user_specified_plan(reference: &PlanReference) -> String {
    let kind = match reference.scope() {
        CatalogScope::Cluster => "ClusterServicePlan",
        CatalogScope::Namespaced => "ServicePlan",
    };
    format!("{kind}/{}", reference.plan())
}

fn refs_for_scope(instance: &ServiceInstance, scope: CatalogScope) -> (Option<&str>, Option<&str>) {
    let spec = &instance.spec;
    let (class, plan) = match scope {
        CatalogScope::Cluster => (&spec.cluster_service_class_ref, &spec.cluster_service_plan_ref),
        CatalogScope::Namespaced => (&spec.service_class_ref, &spec.service_plan_ref),
    };
    (
        class.as_ref().map(|r| r.name.as_str()),
        plan.as_ref().map(|r| r.name.as_str()),
    )
}

fn set_refs(instance: &mut ServiceInstance, scope: CatalogScope, class: String, plan: String) {
    let class = Some(LocalObjectReference { name: class });
    let plan = Some(LocalObjectReference { name: plan });
    match scope {
        CatalogScope::Cluster => {
            instance.spec.cluster_service_class_ref = class;
            instance.spec.cluster_service_plan_ref = plan;
        }
        CatalogScope::Namespaced => {
            instance.spec.service_class_ref = class;
            instance.spec.service_plan_ref = plan;
        }
    }
}

/// Namespace to search for catalog entities of a scope.
fn catalog_namespace(instance: &ServiceInstance, scope: CatalogScope) -> Option<String> {
    match scope {
        CatalogScope::Cluster => None,
        CatalogScope::Namespaced => instance.namespace(),
    }
}

fn entity_key(namespace: Option<&str>, name: &str) -> ObjectKey {
    match namespace {
        Some(ns) => ObjectKey::namespaced(ns, name),
        None => ObjectKey::cluster(name),
    }
}

async fn resolve<C: ClassResource, P: PlanResource>(
    ctx: &Context,
    instance: &ServiceInstance,
    reference: &PlanReference,
) -> Result<(String, String), ReconcileError> {
    let namespace = catalog_namespace(instance, reference.scope());
    let (recorded_class, recorded_plan) = refs_for_scope(instance, reference.scope());

    // The class is never re-resolved once recorded.
    let class_name = match recorded_class {
        Some(name) => name.to_string(),
        None => find_class::<C>(ctx, namespace.as_deref(), reference).await?.name_any(),
    };

    if let Some(name) = recorded_plan {
        match P::store(&ctx.stores).get(&entity_key(namespace.as_deref(), name)).await {
            Ok(plan) if plan_matches(&plan, reference) => {
                return Ok((class_name, name.to_string()));
            }
            Ok(_) => debug!(
                "Plan reference of ServiceInstance {}/{} changed, resolving again",
                instance.namespace().unwrap_or_default(),
                instance.name_any()
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let plan = find_plan::<P>(ctx, namespace.as_deref(), &class_name, reference).await?;
    Ok((class_name, plan.name_any()))
}

fn plan_matches<P: PlanResource>(plan: &P, reference: &PlanReference) -> bool {
    match reference.addressing() {
        Addressing::KubeName => plan.name_any() == reference.plan(),
        Addressing::ExternalName => plan.common_spec().external_name == reference.plan(),
        Addressing::ExternalId => plan.common_spec().external_id == reference.plan(),
    }
}

fn class_not_found(reference: &PlanReference) -> ReconcileError {
    ReconcileError::transient(
        REASON_NONEXISTENT_CLASS,
        format!("References a non-existent {reference}: class not found"),
    )
}

fn plan_not_found(reference: &PlanReference) -> ReconcileError {
    ReconcileError::transient(
        REASON_PLAN_NOT_FOUND,
        format!("References a non-existent {reference}: plan not found"),
    )
}

async fn find_class<C: ClassResource>(
    ctx: &Context,
    namespace: Option<&str>,
    reference: &PlanReference,
) -> Result<C, ReconcileError> {
    let store = C::store(&ctx.stores);
    let wanted = reference.class();
    let (label, field): (&str, fn(&CommonServiceClassSpec) -> &str) = match reference.addressing()
    {
        Addressing::KubeName => {
            return match store.get(&entity_key(namespace, wanted)).await {
                Ok(class) => Ok(class),
                Err(e) if e.is_not_found() => Err(class_not_found(reference)),
                Err(e) => Err(e.into()),
            };
        }
        Addressing::ExternalName => (LABEL_EXTERNAL_NAME, |s| s.external_name.as_str()),
        Addressing::ExternalId => (LABEL_EXTERNAL_ID, |s| s.external_id.as_str()),
    };

    let selector = format!("{label}={}", hashed_label_value(wanted));
    let mut matches: Vec<C> = store
        .list(namespace, Some(&selector))
        .await?
        .into_iter()
        .filter(|class| field(class.common_spec()) == wanted)
        .collect();
    match matches.len() {
        0 => Err(class_not_found(reference)),
        1 => Ok(matches.remove(0)),
        n => Err(ReconcileError::validation(
            REASON_NONEXISTENT_CLASS,
            format!("{reference} is ambiguous: {n} classes match"),
        )),
    }
}

async fn find_plan<P: PlanResource>(
    ctx: &Context,
    namespace: Option<&str>,
    class_name: &str,
    reference: &PlanReference,
) -> Result<P, ReconcileError> {
    let store = P::store(&ctx.stores);
    let wanted = reference.plan();
    let label = match reference.addressing() {
        Addressing::KubeName => {
            let plan = match store.get(&entity_key(namespace, wanted)).await {
                Ok(plan) => plan,
                Err(e) if e.is_not_found() => return Err(plan_not_found(reference)),
                Err(e) => return Err(e.into()),
            };
            if plan.class_name() != class_name {
                return Err(ReconcileError::validation(
                    REASON_PLAN_NOT_FOUND,
                    format!(
                        "{reference}: plan {wanted:?} does not belong to class {class_name:?}"
                    ),
                ));
            }
            return Ok(plan);
        }
        Addressing::ExternalName => LABEL_EXTERNAL_NAME,
        Addressing::ExternalId => LABEL_EXTERNAL_ID,
    };

    let selector = format!(
        "{label}={},{}={}",
        hashed_label_value(wanted),
        P::CLASS_NAME_LABEL,
        hashed_label_value(class_name)
    );
    let mut matches: Vec<P> = store
        .list(namespace, Some(&selector))
        .await?
        .into_iter()
        .filter(|plan| plan.class_name() == class_name && plan_matches(plan, reference))
        .collect();
    match matches.len() {
        0 => Err(plan_not_found(reference)),
        1 => Ok(matches.remove(0)),
        n => Err(ReconcileError::validation(
            REASON_PLAN_NOT_FOUND,
            format!("{reference} is ambiguous: {n} plans match"),
        )),
    }
}

/// Scope and names of the resolved class and plan, if resolution has happened.
fn resolved(instance: &ServiceInstance) -> Option<(CatalogScope, &str, &str)> {
    let spec = &instance.spec;
    if let (Some(class), Some(plan)) = (&spec.cluster_service_class_ref, &spec.cluster_service_plan_ref)
    {
        return Some((CatalogScope::Cluster, &class.name, &plan.name));
    }
    if let (Some(class), Some(plan)) = (&spec.service_class_ref, &spec.service_plan_ref) {
        return Some((CatalogScope::Namespaced, &class.name, &plan.name));
    }
    None
}

/// Load the class and plan an instance resolved to.
///
/// # Errors
///
/// `Transient(ReferencesNonexistentServiceClass)` or `Transient(PlanNotFound)` when
/// an entity is missing; `Validation(ErrorInvalidPlanReference)` before resolution.
pub async fn load_catalog_entry(
    ctx: &Context,
    instance: &ServiceInstance,
) -> Result<CatalogEntry, ReconcileError> {
    let Some((scope, class_name, plan_name)) = resolved(instance) else {
        return Err(ReconcileError::validation(
            REASON_INVALID_PLAN_REFERENCE,
            "The class and plan of this instance have not been resolved",
        ));
    };
    match scope {
        CatalogScope::Cluster => {
            load::<ClusterServiceClass, ClusterServicePlan>(ctx, instance, scope, class_name, plan_name)
                .await
        }
        CatalogScope::Namespaced => {
            load::<ServiceClass, ServicePlan>(ctx, instance, scope, class_name, plan_name).await
        }
    }
}

async fn load<C: ClassResource, P: PlanResource>(
    ctx: &Context,
    instance: &ServiceInstance,
    scope: CatalogScope,
    class_name: &str,
    plan_name: &str,
) -> Result<CatalogEntry, ReconcileError> {
    let namespace = catalog_namespace(instance, scope);
    let class_key = entity_key(namespace.as_deref(), class_name);
    let class = C::store(&ctx.stores).get(&class_key).await.map_err(|e| {
        if e.is_not_found() {
            ReconcileError::transient(
                REASON_NONEXISTENT_CLASS,
                format!("References a non-existent {} {class_key}", C::kind(&())),
            )
        } else {
            e.into()
        }
    })?;
    let plan_key = entity_key(namespace.as_deref(), plan_name);
    let plan = P::store(&ctx.stores).get(&plan_key).await.map_err(|e| {
        if e.is_not_found() {
            ReconcileError::transient(
                REASON_PLAN_NOT_FOUND,
                format!("References a non-existent {} {plan_key}", P::kind(&())),
            )
        } else {
            e.into()
        }
    })?;
    Ok(CatalogEntry {
        scope,
        broker: entity_key(namespace.as_deref(), class.broker_name()),
        class_name: class.name_any(),
        plan_name: plan.name_any(),
        class_removed: class.removed_from_broker_catalog(),
        plan_removed: plan.removed_from_broker_catalog(),
        class: class.common_spec().clone(),
        plan: plan.common_spec().clone(),
    })
}

/// Scope and broker of the class an instance resolved to.
///
/// Only the class is read, so this works after the plan has been deleted.
///
/// # Errors
///
/// As [`load_catalog_entry`], without the plan lookup.
pub async fn instance_broker(
    ctx: &Context,
    instance: &ServiceInstance,
) -> Result<(CatalogScope, ObjectKey), ReconcileError> {
    let Some((scope, class_name, _)) = resolved(instance) else {
        return Err(ReconcileError::validation(
            REASON_INVALID_PLAN_REFERENCE,
            "The class and plan of this instance have not been resolved",
        ));
    };
    let namespace = catalog_namespace(instance, scope);
    let broker_name = match scope {
        CatalogScope::Cluster => {
            class_broker_name::<ClusterServiceClass>(ctx, namespace.as_deref(), class_name).await?
        }
        CatalogScope::Namespaced => {
            class_broker_name::<ServiceClass>(ctx, namespace.as_deref(), class_name).await?
        }
    };
    Ok((scope, entity_key(namespace.as_deref(), &broker_name)))
}

async fn class_broker_name<C: ClassResource>(
    ctx: &Context,
    namespace: Option<&str>,
    class_name: &str,
) -> Result<String, ReconcileError> {
    let key = entity_key(namespace, class_name);
    match C::store(&ctx.stores).get(&key).await {
        Ok(class) => Ok(class.broker_name().to_string()),
        Err(e) if e.is_not_found() => Err(ReconcileError::transient(
            REASON_NONEXISTENT_CLASS,
            format!("References a non-existent {} {key}", C::kind(&())),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Whether `instance` resolved to the class `name` of `scope`.
#[must_use]
pub fn instance_uses_class(instance: &ServiceInstance, scope: CatalogScope, name: &str) -> bool {
    resolved(instance).is_some_and(|(s, class, _)| s == scope && class == name)
}

/// Whether `instance` resolved to the plan `name` of `scope`.
#[must_use]
pub fn instance_uses_plan(instance: &ServiceInstance, scope: CatalogScope, name: &str) -> bool {
    resolved(instance).is_some_and(|(s, _, plan)| s == scope && plan == name)
}

#[cfg(test)]
#[path = "references_tests.rs"]
mod references_tests;
