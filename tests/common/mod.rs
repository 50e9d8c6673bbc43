// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

// Common test utilities for end-to-end scenario tests.
//
// Everything runs in-process: in-memory stores stand in for the API server and
// wiremock stands in for the broker.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use svcat::context::{Context, Settings};
use svcat::crd::{
    ClusterServiceBroker, ClusterServiceBrokerSpec, CommonServiceBrokerSpec, Condition,
    LocalObjectReference, PlanReference, ServiceBinding, ServiceBindingSpec, ServiceInstance,
    ServiceInstanceSpec,
};
use svcat::engine::{Engine, EngineConfig};
use svcat::metrics::Metrics;
use svcat::osb::BrokerClientManager;
use svcat::reconcilers::status::find_condition;
use svcat::store::{ObjectKey, SharedStore, Stores};
use svcat::status_reasons::{CONDITION_TRUE, CONDITION_TYPE_FAILED, CONDITION_TYPE_READY};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const NAMESPACE: &str = "e2e";
pub const BROKER: &str = "broker-a";

/// Settings with polls and backoff in the millisecond range.
pub fn fast_settings() -> Settings {
    Settings {
        cluster_id: "e2e-cluster".to_string(),
        poll_initial: Duration::from_millis(10),
        poll_max: Duration::from_millis(40),
        orphan_mitigation_attempts: 3,
        queue_base_delay: Duration::from_millis(5),
        queue_max_delay: Duration::from_millis(50),
        ..Settings::default()
    }
}

pub fn context() -> Arc<Context> {
    Arc::new(Context::new(
        Stores::in_memory(),
        BrokerClientManager::new(),
        Arc::new(Metrics::new().unwrap()),
        fast_settings(),
    ))
}

/// An engine running in the background until [`RunningEngine::stop`].
pub struct RunningEngine {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningEngine {
    pub fn start(ctx: &Arc<Context>) -> Self {
        let config = EngineConfig {
            broker_concurrency: 1,
            instance_concurrency: 2,
            binding_concurrency: 2,
            reconcile_timeout: Duration::from_secs(5),
            watch_namespace: None,
        };
        let (stop, stopped) = oneshot::channel::<()>();
        let engine = Engine::new(Arc::clone(ctx), config);
        let handle = tokio::spawn(engine.run(async {
            let _ = stopped.await;
        }));
        Self { stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("engine did not stop")
            .unwrap();
    }
}

/// Poll `check` until it yields a value or five seconds pass.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the object at `key` satisfies `pred` and return it.
pub async fn wait_for<K, P>(store: &SharedStore<K>, key: &ObjectKey, what: &str, pred: P) -> K
where
    K: Clone + Send + Sync + 'static,
    P: Fn(&K) -> bool,
{
    let pred = &pred;
    eventually(what, || async move {
        match store.get(key).await {
            Ok(obj) if pred(&obj) => Some(obj),
            _ => None,
        }
    })
    .await
}

pub fn condition_is_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

pub fn ready(conditions: &[Condition]) -> bool {
    condition_is_true(conditions, CONDITION_TYPE_READY)
}

pub fn failed(conditions: &[Condition]) -> bool {
    condition_is_true(conditions, CONDITION_TYPE_FAILED)
}

pub fn ready_reason(conditions: &[Condition]) -> Option<String> {
    find_condition(conditions, CONDITION_TYPE_READY).and_then(|c| c.reason.clone())
}

/// A catalog with one bindable service `c1` and its plan `p1`.
pub fn single_service_catalog() -> Value {
    json!({
        "services": [{
            "id": "c1-id",
            "name": "c1",
            "description": "test service",
            "bindable": true,
            "plans": [{"id": "p1-id", "name": "p1", "description": "test plan"}]
        }]
    })
}

pub fn cluster_broker(url: &str) -> ClusterServiceBroker {
    ClusterServiceBroker::new(
        BROKER,
        ClusterServiceBrokerSpec {
            common: CommonServiceBrokerSpec {
                url: url.to_string(),
                ..CommonServiceBrokerSpec::default()
            },
            auth_info: None,
        },
    )
}

/// An instance asking for `class/plan` by cluster external name.
pub fn instance(name: &str, class: &str, plan: &str) -> ServiceInstance {
    let reference = PlanReference::ClusterExternalName {
        class: class.to_string(),
        plan: plan.to_string(),
    };
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            plan_reference: (&reference).into(),
            external_id: format!("{name}-externalID"),
            ..ServiceInstanceSpec::default()
        },
    );
    instance.metadata.namespace = Some(NAMESPACE.to_string());
    instance
}

pub fn binding(name: &str, instance: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance.to_string(),
            },
            secret_name: format!("{name}-secret"),
            external_id: format!("{name}-externalID"),
            ..ServiceBindingSpec::default()
        },
    );
    binding.metadata.namespace = Some(NAMESPACE.to_string());
    binding
}
