// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared fixtures for reconciler tests.

use super::broker::{class_labels, plan_labels};
use crate::context::{Context, Settings};
use crate::crd::{
    ClusterServiceBroker, ClusterServiceBrokerSpec, ClusterServiceClass, ClusterServicePlan,
    CommonServiceBrokerSpec, CommonServiceClassSpec, CommonServicePlanSpec, DeprovisionStatus,
    ClassResource, LocalObjectReference, PlanReference, PlanResource, ServiceBinding,
    ServiceBindingSpec, ServiceInstance, ServiceInstanceProvisionStatus,
    ServiceInstancePropertiesState, ServiceInstanceSpec, ServiceInstanceStatus,
};
use crate::labels::FINALIZER_SERVICE_CATALOG;
use crate::metrics::Metrics;
use crate::osb::BrokerClientManager;
use crate::reconcilers::status::set_ready;
use crate::status_reasons::REASON_PROVISIONED_SUCCESSFULLY;
use crate::store::Stores;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_NAMESPACE: &str = "test-ns";
pub const TEST_BROKER: &str = "test-broker";
pub const TEST_CLASS: &str = "mysql-class";
pub const TEST_PLAN_SMALL: &str = "mysql-small";
pub const TEST_PLAN_LARGE: &str = "mysql-large";

/// Settings with fast polls and queues.
#[must_use]
pub fn test_settings() -> Settings {
    Settings {
        cluster_id: "test-cluster".to_string(),
        poll_initial: Duration::from_millis(10),
        poll_max: Duration::from_millis(50),
        orphan_mitigation_attempts: 3,
        queue_base_delay: Duration::from_millis(1),
        queue_max_delay: Duration::from_millis(10),
        ..Settings::default()
    }
}

#[must_use]
pub fn test_context() -> Arc<Context> {
    test_context_with(test_settings())
}

#[must_use]
pub fn test_context_with(settings: Settings) -> Arc<Context> {
    Arc::new(Context::new(
        Stores::in_memory(),
        BrokerClientManager::new(),
        Arc::new(Metrics::new().unwrap()),
        settings,
    ))
}

/// A catalog with one bindable, plan-updatable service and two plans.
#[must_use]
pub fn catalog_json() -> Value {
    json!({
        "services": [{
            "id": "svc-mysql",
            "name": "mysql",
            "description": "MySQL databases",
            "bindable": true,
            "plan_updatable": true,
            "tags": ["sql"],
            "plans": [
                {"id": "plan-small", "name": "small", "description": "Small", "free": true},
                {"id": "plan-large", "name": "large", "description": "Large", "free": false}
            ]
        }]
    })
}

#[must_use]
pub fn cluster_broker(name: &str, url: &str) -> ClusterServiceBroker {
    ClusterServiceBroker::new(
        name,
        ClusterServiceBrokerSpec {
            common: CommonServiceBrokerSpec {
                url: url.to_string(),
                ..CommonServiceBrokerSpec::default()
            },
            auth_info: None,
        },
    )
}

pub async fn create_cluster_broker(ctx: &Context, url: &str) -> ClusterServiceBroker {
    ctx.stores
        .cluster_service_brokers
        .create(&cluster_broker(TEST_BROKER, url))
        .await
        .unwrap()
}

/// Class and plan specs matching [`catalog_json`].
#[must_use]
pub fn mysql_class_spec() -> CommonServiceClassSpec {
    CommonServiceClassSpec {
        external_name: "mysql".to_string(),
        external_id: "svc-mysql".to_string(),
        description: "MySQL databases".to_string(),
        bindable: true,
        plan_updatable: true,
        tags: vec!["sql".to_string()],
        ..CommonServiceClassSpec::default()
    }
}

#[must_use]
pub fn plan_spec(external_name: &str, external_id: &str) -> CommonServicePlanSpec {
    CommonServicePlanSpec {
        external_name: external_name.to_string(),
        external_id: external_id.to_string(),
        description: external_name.to_string(),
        free: true,
        ..CommonServicePlanSpec::default()
    }
}

fn meta(name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..ObjectMeta::default()
    }
}

/// Create the cluster class and both plans of [`catalog_json`] directly in the stores.
pub async fn seed_cluster_catalog(ctx: &Context) {
    seed_cluster_class(ctx, mysql_class_spec()).await;
    seed_cluster_plan(ctx, TEST_PLAN_SMALL, plan_spec("small", "plan-small")).await;
    seed_cluster_plan(ctx, TEST_PLAN_LARGE, plan_spec("large", "plan-large")).await;
}

pub async fn seed_cluster_class(ctx: &Context, spec: CommonServiceClassSpec) -> ClusterServiceClass {
    let labels = class_labels::<ClusterServiceClass>(TEST_BROKER, &spec);
    let class = ClusterServiceClass::from_catalog(meta(TEST_CLASS, labels), TEST_BROKER, spec);
    ctx.stores.cluster_service_classes.create(&class).await.unwrap()
}

pub async fn seed_cluster_plan(
    ctx: &Context,
    name: &str,
    spec: CommonServicePlanSpec,
) -> ClusterServicePlan {
    let labels = plan_labels::<ClusterServicePlan>(TEST_BROKER, TEST_CLASS, &spec);
    let plan = ClusterServicePlan::from_catalog(meta(name, labels), TEST_BROKER, TEST_CLASS, spec);
    ctx.stores.cluster_service_plans.create(&plan).await.unwrap()
}

/// An instance asking for `class`/`plan` by cluster external name.
#[must_use]
pub fn instance(name: &str, class: &str, plan: &str) -> ServiceInstance {
    let reference = PlanReference::ClusterExternalName {
        class: class.to_string(),
        plan: plan.to_string(),
    };
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            plan_reference: (&reference).into(),
            external_id: format!("{name}-id"),
            ..ServiceInstanceSpec::default()
        },
    );
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    instance
}

pub async fn create_instance(ctx: &Context, instance: &ServiceInstance) -> ServiceInstance {
    ctx.stores.service_instances.create(instance).await.unwrap()
}

/// A provisioned, ready instance of the small mysql plan.
pub async fn create_provisioned_instance(ctx: &Context, name: &str) -> ServiceInstance {
    let mut instance = instance(name, "mysql", "small");
    instance.metadata.finalizers = Some(vec![FINALIZER_SERVICE_CATALOG.to_string()]);
    instance.spec.cluster_service_class_ref = Some(LocalObjectReference {
        name: TEST_CLASS.to_string(),
    });
    instance.spec.cluster_service_plan_ref = Some(LocalObjectReference {
        name: TEST_PLAN_SMALL.to_string(),
    });
    let mut status = ServiceInstanceStatus {
        provision_status: ServiceInstanceProvisionStatus::Provisioned,
        deprovision_status: DeprovisionStatus::Required,
        reconciled_generation: 1,
        observed_generation: 1,
        external_properties: Some(ServiceInstancePropertiesState {
            class_external_id: "svc-mysql".to_string(),
            plan_external_name: "small".to_string(),
            plan_external_id: "plan-small".to_string(),
            ..ServiceInstancePropertiesState::default()
        }),
        ..ServiceInstanceStatus::default()
    };
    set_ready(&mut status, true, REASON_PROVISIONED_SUCCESSFULLY, "The instance was provisioned successfully");
    instance.status = Some(status);
    create_instance(ctx, &instance).await
}

#[must_use]
pub fn binding(name: &str, instance: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance.to_string(),
            },
            external_id: format!("{name}-id"),
            ..ServiceBindingSpec::default()
        },
    );
    binding.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    binding
}

pub async fn create_binding(ctx: &Context, binding: &ServiceBinding) -> ServiceBinding {
    ctx.stores.service_bindings.create(binding).await.unwrap()
}

#[must_use]
pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}
