// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `admission.rs`

#[cfg(test)]
mod tests {
    use crate::admission::{admission_router, AdmissionState};
    use crate::constants::ADMISSION_PATH;
    use crate::reconcilers::testing::{
        binding, create_provisioned_instance, test_context, TEST_NAMESPACE,
    };
    use crate::store::ObjectKey;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kube::api::DeleteParams;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn review(operation: &str, instance: &str) -> Value {
        let object = serde_json::to_value(binding("creds", instance)).unwrap();
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "servicecatalog.k8s.io", "version": "v1beta1", "kind": "ServiceBinding"},
                "resource": {"group": "servicecatalog.k8s.io", "version": "v1beta1", "resource": "servicebindings"},
                "operation": operation,
                "userInfo": {"username": "alice"},
                "name": "creds",
                "namespace": TEST_NAMESPACE,
                "object": object,
                "dryRun": false
            }
        })
    }

    async fn submit(state: Arc<AdmissionState>, body: &Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri(ADMISSION_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = admission_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn allowed(review: &Value) -> bool {
        review["response"]["allowed"].as_bool().unwrap()
    }

    #[tokio::test]
    async fn test_create_against_live_instance_is_allowed() {
        let ctx = test_context();
        create_provisioned_instance(&ctx, "db").await;
        let state = Arc::new(AdmissionState::new(Arc::clone(&ctx.stores.service_instances)));

        let reply = submit(state, &review("CREATE", "db")).await;
        assert!(allowed(&reply));
        assert_eq!(reply["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    }

    #[tokio::test]
    async fn test_create_against_deleting_instance_is_denied() {
        let ctx = test_context();
        let instance = create_provisioned_instance(&ctx, "db").await;
        ctx.stores
            .service_instances
            .delete(&ObjectKey::of(&instance), &DeleteParams::default())
            .await
            .unwrap();
        let state = Arc::new(AdmissionState::new(Arc::clone(&ctx.stores.service_instances)));

        let reply = submit(state, &review("CREATE", "db")).await;
        assert!(!allowed(&reply));
        let message = reply["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains(
            "ServiceBinding test-ns/creds references a ServiceInstance that is being deleted"
        ));
    }

    #[tokio::test]
    async fn test_missing_instance_is_allowed() {
        let ctx = test_context();
        let state = Arc::new(AdmissionState::new(Arc::clone(&ctx.stores.service_instances)));

        let reply = submit(state, &review("CREATE", "not-there")).await;
        assert!(allowed(&reply));
    }

    #[tokio::test]
    async fn test_update_is_not_checked() {
        let ctx = test_context();
        let instance = create_provisioned_instance(&ctx, "db").await;
        ctx.stores
            .service_instances
            .delete(&ObjectKey::of(&instance), &DeleteParams::default())
            .await
            .unwrap();
        let state = Arc::new(AdmissionState::new(Arc::clone(&ctx.stores.service_instances)));

        let reply = submit(state, &review("UPDATE", "db")).await;
        assert!(allowed(&reply));
    }

    #[tokio::test]
    async fn test_malformed_review_is_rejected_as_invalid() {
        let ctx = test_context();
        let state = Arc::new(AdmissionState::new(Arc::clone(&ctx.stores.service_instances)));

        // A review without a request cannot be answered for any uid.
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
        let reply = submit(state, &body).await;
        assert!(!allowed(&reply));
    }
}
