// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `engine.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{ParametersFromSource, SecretKeyReference, ServiceInstance};
    use crate::engine::{enqueue_parameter_readers, watch_kind, Engine, EngineConfig};
    use crate::reconcilers::status::is_ready;
    use crate::reconcilers::testing::{
        binding, catalog_json, create_binding, create_cluster_broker, create_instance, instance,
        secret, test_context, TEST_BROKER, TEST_NAMESPACE,
    };
    use crate::store::{MemoryStore, ObjectKey, SharedStore, WatchEvent};
    use kube::ResourceExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            broker_concurrency: 1,
            instance_concurrency: 2,
            binding_concurrency: 2,
            reconcile_timeout: Duration::from_secs(5),
            watch_namespace: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.broker_concurrency, 5);
        assert_eq!(config.instance_concurrency, 5);
        assert_eq!(config.binding_concurrency, 5);
        assert_eq!(config.reconcile_timeout, Duration::from_secs(60));
        assert!(config.watch_namespace.is_none());
    }

    #[tokio::test]
    async fn test_watch_kind_lists_existing_objects_then_streams() {
        let store: SharedStore<ServiceInstance> = Arc::new(MemoryStore::new());
        store.create(&instance("first", "mysql", "small")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watch_kind(Arc::clone(&store), None, move |event| {
            let tx = tx.clone();
            async move {
                let added = matches!(event, WatchEvent::Added(_));
                let _ = tx.send((event.object().name_any(), added));
            }
        }));

        let (name, added) = rx.recv().await.unwrap();
        assert_eq!(name, "first");
        assert!(added, "existing objects are surfaced as Added");

        store.create(&instance("second", "mysql", "small")).await.unwrap();
        let (name, _) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "second");
        task.abort();
    }

    #[tokio::test]
    async fn test_engine_syncs_broker_and_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_json()))
            .mount(&server)
            .await;

        let ctx = test_context();
        create_cluster_broker(&ctx, &server.uri()).await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let engine = Engine::new(Arc::clone(&ctx), fast_config());
        let running = tokio::spawn(engine.run(async {
            let _ = stop_rx.await;
        }));

        let key = ObjectKey::cluster(TEST_BROKER);
        let mut ready = false;
        for _ in 0..200 {
            let broker = ctx.stores.cluster_service_brokers.get(&key).await.unwrap();
            if broker.status.as_ref().is_some_and(is_ready) {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready, "broker should become ready through the engine");
        let classes = ctx.stores.cluster_service_classes.list(None, None).await.unwrap();
        assert_eq!(classes.len(), 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("engine should stop after shutdown")
            .unwrap();
        assert!(ctx.queues.cluster_service_brokers.is_shutting_down());
        assert_eq!(ctx.queues.in_flight(), 0);
    }

    fn from_secret(name: &str) -> Vec<ParametersFromSource> {
        vec![ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.to_string(),
                key: "params".to_string(),
            }),
        }]
    }

    #[tokio::test]
    async fn test_secret_change_enqueues_parameter_readers() {
        let ctx = test_context();
        let mut reader = instance("reader", "mysql", "small");
        reader.spec.parameters_from = from_secret("db-params");
        create_instance(&ctx, &reader).await;
        let mut other = instance("other", "mysql", "small");
        other.spec.parameters_from = from_secret("unrelated");
        create_instance(&ctx, &other).await;
        create_instance(&ctx, &instance("plain", "mysql", "small")).await;

        let mut bound = binding("creds", "plain");
        bound.spec.parameters_from = from_secret("db-params");
        create_binding(&ctx, &bound).await;
        create_binding(&ctx, &binding("unbound", "plain")).await;

        let changed = secret(TEST_NAMESPACE, "db-params", &[("params", "{}")]);
        enqueue_parameter_readers(&ctx, &changed).await;

        assert_eq!(ctx.queues.service_instances.len(), 1);
        assert_eq!(
            ctx.queues.service_instances.get().await,
            Some(ObjectKey::namespaced(TEST_NAMESPACE, "reader"))
        );
        assert_eq!(ctx.queues.service_bindings.len(), 1);
        assert_eq!(
            ctx.queues.service_bindings.get().await,
            Some(ObjectKey::namespaced(TEST_NAMESPACE, "creds"))
        );
    }

    #[tokio::test]
    async fn test_secret_in_other_namespace_enqueues_nothing() {
        let ctx = test_context();
        let mut reader = instance("reader", "mysql", "small");
        reader.spec.parameters_from = from_secret("db-params");
        create_instance(&ctx, &reader).await;

        let elsewhere = secret("other-ns", "db-params", &[("params", "{}")]);
        enqueue_parameter_readers(&ctx, &elsewhere).await;

        assert_eq!(ctx.queues.service_instances.len(), 0);
        assert_eq!(ctx.queues.service_bindings.len(), 0);
    }
}
