// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Wires watch streams, work queues and dispatchers into a running control plane.
//!
//! Every reconciled kind has a watch that enqueues the changed key. A few
//! events also wake collaborators:
//!
//! - a broker event (its catalog was synced) enqueues the instances that can
//!   see that broker's classes, so removed plans and new defaults are noticed
//! - a ready instance enqueues the bindings that reference it
//! - a deleted binding enqueues its instance, which may be waiting to deprovision
//! - a secret event enqueues the instances and bindings that read parameters from it
//!
//! Shutdown drains the queues, waits for in-flight passes, then stops the watches.

use crate::context::Context;
use crate::crd::{
    ClusterServiceBroker, ParametersFromSource, ServiceBinding, ServiceBroker, ServiceInstance,
};
use crate::dispatcher::{Dispatcher, Reconciler};
use crate::queue::WorkQueue;
use crate::reconcilers::status::is_ready;
use crate::reconcilers::{BindingReconciler, BrokerReconciler, InstanceReconciler};
use crate::store::{ObjectKey, SharedStore, WatchEvent};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Worker counts, timeouts and the watch scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub broker_concurrency: usize,
    pub instance_concurrency: usize,
    pub binding_concurrency: usize,
    /// Upper bound for one reconcile pass.
    pub reconcile_timeout: Duration,
    /// Restrict namespaced watches to one namespace.
    pub watch_namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        use crate::constants::{DEFAULT_CONCURRENCY, DEFAULT_RECONCILE_TIMEOUT_SECS};
        Self {
            broker_concurrency: DEFAULT_CONCURRENCY,
            instance_concurrency: DEFAULT_CONCURRENCY,
            binding_concurrency: DEFAULT_CONCURRENCY,
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            watch_namespace: None,
        }
    }
}

/// The reconcile engine for all four driven kinds.
pub struct Engine {
    ctx: Arc<Context>,
    config: EngineConfig,
}

impl Engine {
    #[must_use]
    pub fn new(ctx: Arc<Context>, config: EngineConfig) -> Self {
        Self { ctx, config }
    }

    /// Run until `shutdown` resolves, then drain and stop.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut watches = JoinSet::new();
        self.spawn_watches(&mut watches);

        let mut dispatchers = JoinSet::new();
        for dispatcher in self.dispatchers() {
            dispatchers.spawn(dispatcher.run());
        }
        info!(
            brokers = self.config.broker_concurrency,
            instances = self.config.instance_concurrency,
            bindings = self.config.binding_concurrency,
            "Reconcile engine running"
        );

        shutdown.await;

        info!(in_flight = self.ctx.queues.in_flight(), "Draining work queues");
        self.ctx.shut_down();
        while dispatchers.join_next().await.is_some() {}
        watches.shutdown().await;
        info!("Reconcile engine stopped");
    }

    fn dispatchers(&self) -> Vec<Dispatcher> {
        let queues = &self.ctx.queues;
        let timeout = self.config.reconcile_timeout;
        let dispatcher = |reconciler: Arc<dyn Reconciler>, queue: &WorkQueue<ObjectKey>, workers| {
            Dispatcher::new(reconciler, queue.clone(), workers, timeout, Arc::clone(&self.ctx.metrics))
        };
        vec![
            dispatcher(
                Arc::new(BrokerReconciler::<ClusterServiceBroker>::new(Arc::clone(&self.ctx))),
                &queues.cluster_service_brokers,
                self.config.broker_concurrency,
            ),
            dispatcher(
                Arc::new(BrokerReconciler::<ServiceBroker>::new(Arc::clone(&self.ctx))),
                &queues.service_brokers,
                self.config.broker_concurrency,
            ),
            dispatcher(
                Arc::new(InstanceReconciler::new(Arc::clone(&self.ctx))),
                &queues.service_instances,
                self.config.instance_concurrency,
            ),
            dispatcher(
                Arc::new(BindingReconciler::new(Arc::clone(&self.ctx))),
                &queues.service_bindings,
                self.config.binding_concurrency,
            ),
        ]
    }

    fn spawn_watches(&self, watches: &mut JoinSet<()>) {
        let stores = &self.ctx.stores;
        let namespace = self.config.watch_namespace.clone();

        let ctx = Arc::clone(&self.ctx);
        watches.spawn(watch_kind(
            Arc::clone(&stores.cluster_service_brokers),
            None,
            move |event: WatchEvent<ClusterServiceBroker>| {
                let ctx = Arc::clone(&ctx);
                async move {
                    ctx.queues.cluster_service_brokers.add(ObjectKey::of(event.object()));
                    // Cluster classes are visible from every namespace.
                    enqueue_instances(&ctx, None).await;
                }
            },
        ));

        let ctx = Arc::clone(&self.ctx);
        watches.spawn(watch_kind(
            Arc::clone(&stores.service_brokers),
            namespace.clone(),
            move |event: WatchEvent<ServiceBroker>| {
                let ctx = Arc::clone(&ctx);
                async move {
                    ctx.queues.service_brokers.add(ObjectKey::of(event.object()));
                    enqueue_instances(&ctx, event.object().namespace().as_deref()).await;
                }
            },
        ));

        let ctx = Arc::clone(&self.ctx);
        watches.spawn(watch_kind(
            Arc::clone(&stores.service_instances),
            namespace.clone(),
            move |event: WatchEvent<ServiceInstance>| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let instance = event.object();
                    ctx.queues.service_instances.add(ObjectKey::of(instance));
                    let ready = instance.status.as_ref().is_some_and(is_ready);
                    if ready && !matches!(event, WatchEvent::Deleted(_)) {
                        enqueue_bindings_of(&ctx, instance).await;
                    }
                }
            },
        ));

        let ctx = Arc::clone(&self.ctx);
        watches.spawn(watch_kind(
            Arc::clone(&stores.secrets),
            namespace.clone(),
            move |event: WatchEvent<Secret>| {
                let ctx = Arc::clone(&ctx);
                async move {
                    enqueue_parameter_readers(&ctx, event.object()).await;
                }
            },
        ));

        let ctx = Arc::clone(&self.ctx);
        watches.spawn(watch_kind(
            Arc::clone(&stores.service_bindings),
            namespace,
            move |event: WatchEvent<ServiceBinding>| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let binding = event.object();
                    ctx.queues.service_bindings.add(ObjectKey::of(binding));
                    if matches!(event, WatchEvent::Deleted(_)) {
                        if let Some(namespace) = binding.namespace() {
                            ctx.queues.service_instances.add(ObjectKey::namespaced(
                                namespace,
                                &binding.spec.instance_ref.name,
                            ));
                        }
                    }
                }
            },
        ));
    }
}

/// Feed every object of one kind into `on_event`: a full list first, then the
/// change stream. A stream error triggers a relist.
pub async fn watch_kind<K, F, Fut>(store: SharedStore<K>, namespace: Option<String>, on_event: F)
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    F: Fn(WatchEvent<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    let kind = K::kind(&()).to_string();
    // Subscribe before listing so nothing written in between is missed.
    let mut stream = store.watch(namespace.as_deref());
    relist(&store, namespace.as_deref(), &kind, &on_event).await;

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => on_event(event).await,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Watch interrupted; relisting");
                relist(&store, namespace.as_deref(), &kind, &on_event).await;
            }
        }
    }
    debug!(kind = %kind, "Watch stream closed");
}

async fn relist<K, F, Fut>(store: &SharedStore<K>, namespace: Option<&str>, kind: &str, on_event: &F)
where
    K: Clone + Send + Sync + 'static,
    F: Fn(WatchEvent<K>) -> Fut,
    Fut: Future<Output = ()>,
{
    match store.list(namespace, None).await {
        Ok(objects) => {
            debug!(kind, count = objects.len(), "Listed");
            for obj in objects {
                on_event(WatchEvent::Added(obj)).await;
            }
        }
        Err(e) => warn!(kind, error = %e, "List failed; relying on the watch stream"),
    }
}

async fn enqueue_instances(ctx: &Context, namespace: Option<&str>) {
    match ctx.stores.service_instances.list(namespace, None).await {
        Ok(instances) => {
            for instance in &instances {
                ctx.queues.service_instances.add(ObjectKey::of(instance));
            }
        }
        Err(e) => warn!(error = %e, "Cannot list instances after a catalog change"),
    }
}

async fn enqueue_bindings_of(ctx: &Context, instance: &ServiceInstance) {
    let namespace = instance.namespace();
    let name = instance.name_any();
    match ctx.stores.service_bindings.list(namespace.as_deref(), None).await {
        Ok(bindings) => {
            for binding in bindings.iter().filter(|b| b.spec.instance_ref.name == name) {
                ctx.queues.service_bindings.add(ObjectKey::of(binding));
            }
        }
        Err(e) => warn!(error = %e, "Cannot list bindings of a ready instance"),
    }
}

fn reads_secret(sources: &[ParametersFromSource], secret: &str) -> bool {
    sources
        .iter()
        .filter_map(|source| source.secret_key_ref.as_ref())
        .any(|reference| reference.name == secret)
}

/// Enqueue every instance and binding whose `parametersFrom` names `secret`.
pub(crate) async fn enqueue_parameter_readers(ctx: &Context, secret: &Secret) {
    let Some(namespace) = secret.namespace() else {
        return;
    };
    let name = secret.name_any();

    match ctx.stores.service_instances.list(Some(&namespace), None).await {
        Ok(instances) => {
            let readers = instances.iter().filter(|i| reads_secret(&i.spec.parameters_from, &name));
            for instance in readers {
                ctx.queues.service_instances.add(ObjectKey::of(instance));
            }
        }
        Err(e) => warn!(error = %e, "Cannot list instances after a secret change"),
    }
    match ctx.stores.service_bindings.list(Some(&namespace), None).await {
        Ok(bindings) => {
            let readers = bindings.iter().filter(|b| reads_secret(&b.spec.parameters_from, &name));
            for binding in readers {
                ctx.queues.service_bindings.add(ObjectKey::of(binding));
            }
        }
        Err(e) => warn!(error = %e, "Cannot list bindings after a secret change"),
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
