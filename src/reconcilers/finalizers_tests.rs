// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `finalizers.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{ServiceInstance, ServiceInstanceSpec};
    use crate::labels::FINALIZER_SERVICE_CATALOG;
    use crate::reconcilers::finalizers::{ensure_finalizer, has_finalizer, remove_finalizer};
    use crate::store::{EntityStore, MemoryStore, ObjectKey, SharedStore};
    use kube::api::DeleteParams;
    use kube::ResourceExt;
    use std::sync::Arc;

    fn store() -> SharedStore<ServiceInstance> {
        Arc::new(MemoryStore::new())
    }

    async fn create(store: &SharedStore<ServiceInstance>) -> ServiceInstance {
        let mut instance = ServiceInstance::new("inst", ServiceInstanceSpec::default());
        instance.metadata.namespace = Some("ns".to_string());
        store.create(&instance).await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_finalizer_adds_once() {
        let store = store();
        let instance = create(&store).await;
        assert!(!has_finalizer(&instance, FINALIZER_SERVICE_CATALOG));

        let updated = ensure_finalizer(&store, &instance, FINALIZER_SERVICE_CATALOG)
            .await
            .unwrap();
        assert!(has_finalizer(&updated, FINALIZER_SERVICE_CATALOG));

        let again = ensure_finalizer(&store, &updated, FINALIZER_SERVICE_CATALOG)
            .await
            .unwrap();
        assert_eq!(
            again.metadata.resource_version, updated.metadata.resource_version,
            "no write when the finalizer is present"
        );
        assert_eq!(again.finalizers().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_finalizer_surfaces_conflict() {
        let store = store();
        let instance = create(&store).await;
        let mut newer = instance.clone();
        newer.spec.update_requests = 1;
        store.replace(&newer).await.unwrap();

        let err = ensure_finalizer(&store, &instance, FINALIZER_SERVICE_CATALOG)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_remove_last_finalizer_completes_deletion() {
        let store = store();
        let instance = create(&store).await;
        let instance = ensure_finalizer(&store, &instance, FINALIZER_SERVICE_CATALOG)
            .await
            .unwrap();
        let key = ObjectKey::namespaced("ns", "inst");

        store.delete(&key, &DeleteParams::default()).await.unwrap();
        let deleting = store.get(&key).await.unwrap();
        assert!(deleting.is_being_deleted());

        remove_finalizer(&store, &deleting, FINALIZER_SERVICE_CATALOG)
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());

        // Absent finalizer is a no-op.
        let untouched = remove_finalizer(&store, &instance, "other/finalizer")
            .await
            .unwrap();
        assert_eq!(
            untouched.metadata.resource_version,
            instance.metadata.resource_version
        );
    }
}
