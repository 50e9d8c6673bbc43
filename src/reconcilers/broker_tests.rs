// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the broker reconciler

#[cfg(test)]
mod tests {
    use crate::crd::{
        CatalogRestrictions, ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan,
        LocalObjectReference, RelistBehavior,
    };
    use crate::dispatcher::{Action, Reconciler};
    use crate::labels::FINALIZER_SERVICE_CATALOG;
    use crate::osb::Catalog;
    use crate::reconcilers::broker::{entity_name, validate_catalog, BrokerReconciler};
    use crate::reconcilers::finalizers::has_finalizer;
    use crate::reconcilers::status::{is_failed, is_ready};
    use crate::reconcilers::testing::{
        catalog_json, cluster_broker, create_instance, instance, test_context, TEST_BROKER,
    };
    use crate::status_reasons::{
        REASON_CATALOG_FETCH_FAILED, REASON_CATALOG_IN_USE, REASON_INVALID_CATALOG,
        REASON_INVALID_RELIST_DURATION,
    };
    use crate::context::Context;
    use crate::crd::ClassResource;
    use crate::crd::PlanResource;
    use crate::store::ObjectKey;
    use kube::api::DeleteParams;
    use kube::ResourceExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn catalog_server(body: serde_json::Value, expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    async fn store_broker(ctx: &Context, broker: ClusterServiceBroker) -> ObjectKey {
        let created = ctx.stores.cluster_service_brokers.create(&broker).await.unwrap();
        ObjectKey::of(&created)
    }

    async fn get_broker(ctx: &Context, key: &ObjectKey) -> ClusterServiceBroker {
        ctx.stores.cluster_service_brokers.get(key).await.unwrap()
    }

    async fn classes(ctx: &Context) -> Vec<ClusterServiceClass> {
        ctx.stores.cluster_service_classes.list(None, None).await.unwrap()
    }

    async fn plans(ctx: &Context) -> Vec<ClusterServicePlan> {
        ctx.stores.cluster_service_plans.list(None, None).await.unwrap()
    }

    fn reconciler(ctx: &Arc<Context>) -> BrokerReconciler<ClusterServiceBroker> {
        BrokerReconciler::new(Arc::clone(ctx))
    }

    #[tokio::test]
    async fn test_sync_creates_catalog_entities() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 1).await;
        let key = store_broker(&ctx, cluster_broker(TEST_BROKER, &server.uri())).await;

        let action = reconciler(&ctx).reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.settings.default_relist_interval));

        let broker = get_broker(&ctx, &key).await;
        assert!(has_finalizer(&broker, FINALIZER_SERVICE_CATALOG));
        let status = broker.status.unwrap();
        assert!(is_ready(&status));
        assert_eq!(status.reconciled_generation, 1);
        assert!(status.last_catalog_retrieval_time.is_some());

        let classes = classes(&ctx).await;
        assert_eq!(classes.len(), 1);
        let class = &classes[0];
        assert_eq!(class.name_any(), entity_name(&key, "svc-mysql"));
        assert_eq!(class.spec.cluster_service_broker_name, TEST_BROKER);
        assert_eq!(class.common_spec().external_name, "mysql");
        assert!(class.common_spec().plan_updatable);
        assert_eq!(
            class.owner_references()[0].name,
            TEST_BROKER,
            "classes are owned by their broker"
        );

        let mut plans = plans(&ctx).await;
        plans.sort_by_key(|p| p.common_spec().external_name.clone());
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].common_spec().external_name, "large");
        assert!(!plans[0].common_spec().free);
        assert_eq!(plans[1].class_name(), class.name_any());
    }

    #[tokio::test]
    async fn test_resync_preserves_default_provision_parameters() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 2).await;
        let mut broker = cluster_broker(TEST_BROKER, &server.uri());
        broker.spec.common.relist_duration = Some("1ms".to_string());
        let key = store_broker(&ctx, broker).await;
        reconciler(&ctx).reconcile(&key).await.unwrap();

        let mut class = classes(&ctx).await.remove(0);
        class.common_spec_mut().default_provision_parameters = Some(json!({"region": "eu"}));
        ctx.stores.cluster_service_classes.replace(&class).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        reconciler(&ctx).reconcile(&key).await.unwrap();

        let class = classes(&ctx).await.remove(0);
        assert_eq!(
            class.common_spec().default_provision_parameters,
            Some(json!({"region": "eu"}))
        );
    }

    #[tokio::test]
    async fn test_catalog_restrictions_filter_plans() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 1).await;
        let mut broker = cluster_broker(TEST_BROKER, &server.uri());
        broker.spec.common.catalog_restrictions = Some(CatalogRestrictions {
            service_class: vec![],
            service_plan: vec!["spec.externalName=small".to_string()],
        });
        let key = store_broker(&ctx, broker).await;

        reconciler(&ctx).reconcile(&key).await.unwrap();

        let plans = plans(&ctx).await;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].common_spec().external_name, "small");
    }

    #[tokio::test]
    async fn test_removed_entities_deleted_or_flagged() {
        let ctx = test_context();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_json()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let key = store_broker(&ctx, cluster_broker(TEST_BROKER, &server.uri())).await;
        reconciler(&ctx).reconcile(&key).await.unwrap();

        // An instance uses the small plan.
        let mut inst = instance("db", "mysql", "small");
        inst.spec.cluster_service_class_ref = Some(LocalObjectReference {
            name: entity_name(&key, "svc-mysql"),
        });
        inst.spec.cluster_service_plan_ref = Some(LocalObjectReference {
            name: entity_name(&key, "plan-small"),
        });
        create_instance(&ctx, &inst).await;

        // The broker drops both plans; only the used one survives, flagged.
        let mut reduced = catalog_json();
        reduced["services"][0]["plans"] = json!([
            {"id": "plan-medium", "name": "medium", "description": "Medium"}
        ]);
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reduced))
            .mount(&server)
            .await;
        let mut broker = get_broker(&ctx, &key).await;
        broker.spec.common.relist_requests += 1;
        ctx.stores.cluster_service_brokers.replace(&broker).await.unwrap();
        reconciler(&ctx).reconcile(&key).await.unwrap();

        let plans = plans(&ctx).await;
        let names: Vec<String> = plans.iter().map(|p| p.common_spec().external_name.clone()).collect();
        assert_eq!(plans.len(), 2, "got {names:?}");
        let small = plans
            .iter()
            .find(|p| p.common_spec().external_name == "small")
            .unwrap();
        assert!(small.removed_from_broker_catalog());
        let medium = plans
            .iter()
            .find(|p| p.common_spec().external_name == "medium")
            .unwrap();
        assert!(!medium.removed_from_broker_catalog());
    }

    #[tokio::test]
    async fn test_invalid_relist_duration_fails_until_spec_changes() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 0).await;
        let mut broker = cluster_broker(TEST_BROKER, &server.uri());
        broker.spec.common.relist_duration = Some("-5m".to_string());
        let key = store_broker(&ctx, broker).await;

        let err = reconciler(&ctx).reconcile(&key).await.unwrap_err();
        assert_eq!(err.reason(), REASON_INVALID_RELIST_DURATION);
        assert!(err.is_terminal());

        let status = get_broker(&ctx, &key).await.status.unwrap();
        assert!(is_failed(&status));
        assert_eq!(status.reconciled_generation, 1);

        let action = reconciler(&ctx).reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_catalog_fetch_error_is_transient() {
        let ctx = test_context();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let key = store_broker(&ctx, cluster_broker(TEST_BROKER, &server.uri())).await;

        let err = reconciler(&ctx).reconcile(&key).await.unwrap_err();
        assert_eq!(err.reason(), REASON_CATALOG_FETCH_FAILED);
        assert!(!err.is_terminal());

        let status = get_broker(&ctx, &key).await.status.unwrap();
        assert!(!is_ready(&status));
        assert!(!is_failed(&status));
        assert!(classes(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_manual_relist_waits_for_spec_change() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 1).await;
        let mut broker = cluster_broker(TEST_BROKER, &server.uri());
        broker.spec.common.relist_behavior = RelistBehavior::Manual;
        let key = store_broker(&ctx, broker).await;

        assert_eq!(
            reconciler(&ctx).reconcile(&key).await.unwrap(),
            Action::await_change()
        );
        assert_eq!(
            reconciler(&ctx).reconcile(&key).await.unwrap(),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn test_duration_relist_requeues_for_remaining_interval() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 1).await;
        let mut broker = cluster_broker(TEST_BROKER, &server.uri());
        broker.spec.common.relist_duration = Some("1h".to_string());
        let key = store_broker(&ctx, broker).await;
        reconciler(&ctx).reconcile(&key).await.unwrap();

        let action = reconciler(&ctx).reconcile(&key).await.unwrap();
        let after = action.requeue_after().unwrap();
        assert!(after <= Duration::from_secs(3600));
        assert!(after > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn test_delete_blocked_while_catalog_in_use() {
        let ctx = test_context();
        let server = catalog_server(catalog_json(), 1).await;
        let key = store_broker(&ctx, cluster_broker(TEST_BROKER, &server.uri())).await;
        reconciler(&ctx).reconcile(&key).await.unwrap();

        let mut inst = instance("db", "mysql", "small");
        inst.spec.cluster_service_class_ref = Some(LocalObjectReference {
            name: entity_name(&key, "svc-mysql"),
        });
        inst.spec.cluster_service_plan_ref = Some(LocalObjectReference {
            name: entity_name(&key, "plan-small"),
        });
        let inst = create_instance(&ctx, &inst).await;

        ctx.stores
            .cluster_service_brokers
            .delete(&key, &DeleteParams::default())
            .await
            .unwrap();
        let action = reconciler(&ctx).reconcile(&key).await.unwrap();
        assert!(action.requeue_after().is_some());
        let status = get_broker(&ctx, &key).await.status.unwrap();
        assert_eq!(status.last_condition_state.as_deref(), Some(REASON_CATALOG_IN_USE));

        ctx.stores
            .service_instances
            .delete(&ObjectKey::of(&inst), &DeleteParams::default())
            .await
            .unwrap();
        let action = reconciler(&ctx).reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.stores.cluster_service_brokers.get(&key).await.unwrap_err().is_not_found());
        assert!(classes(&ctx).await.is_empty());
        assert!(plans(&ctx).await.is_empty());
    }

    #[test]
    fn test_validate_catalog_rejects_duplicate_plan_ids() {
        let mut body = catalog_json();
        body["services"][0]["plans"][1]["id"] = json!("plan-small");
        let catalog: Catalog = serde_json::from_value(body).unwrap();
        let err = validate_catalog(&catalog).unwrap_err();
        assert_eq!(err.reason(), REASON_INVALID_CATALOG);

        let mut body = catalog_json();
        body["services"][0]["plans"] = json!([]);
        let catalog: Catalog = serde_json::from_value(body).unwrap();
        assert!(validate_catalog(&catalog).is_err());

        let catalog: Catalog = serde_json::from_value(catalog_json()).unwrap();
        assert!(validate_catalog(&catalog).is_ok());
    }
}
