// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `memory.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
    use crate::store::memory::{merge_patch, MemoryStore};
    use crate::store::{EntityStore, ObjectKey, StorePatch, WatchEvent};
    use futures::StreamExt;
    use kube::api::{DeleteParams, ObjectMeta, Preconditions};
    use kube::ResourceExt;
    use serde_json::json;
    use std::collections::BTreeMap;

    const NS: &str = "test-ns";

    fn instance(name: &str) -> ServiceInstance {
        ServiceInstance {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: ServiceInstanceSpec::default(),
            status: None,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced(NS, name)
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let store = MemoryStore::new();
        let created = store.create(&instance("a")).await.unwrap();
        assert!(created.resource_version().is_some());
        assert!(created.uid().is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let store = MemoryStore::new();
        store.create(&instance("a")).await.unwrap();
        let err = store.create(&instance("a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store: MemoryStore<ServiceInstance> = MemoryStore::new();
        assert!(store.get(&key("missing")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&instance("a")).await.unwrap();

        let mut first = created.clone();
        first.spec.update_requests = 1;
        store.replace(&first).await.unwrap();

        let mut stale = created;
        stale.spec.update_requests = 2;
        let err = store.replace(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_replace_bumps_generation_only_on_spec_change() {
        let store = MemoryStore::new();
        let created = store.create(&instance("a")).await.unwrap();

        let mut labelled = created.clone();
        labelled
            .labels_mut()
            .insert("team".to_string(), "a".to_string());
        let labelled = store.replace(&labelled).await.unwrap();
        assert_eq!(labelled.metadata.generation, Some(1));

        let mut changed = labelled;
        changed.spec.update_requests = 1;
        let changed = store.replace(&changed).await.unwrap();
        assert_eq!(changed.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_replace_keeps_status_and_replace_status_keeps_spec() {
        let store = MemoryStore::new();
        let created = store.create(&instance("a")).await.unwrap();

        let mut with_status = created.clone();
        with_status.spec.update_requests = 9;
        with_status.status = Some(ServiceInstanceStatus {
            async_op_in_progress: true,
            ..Default::default()
        });
        let after_status = store.replace_status(&with_status).await.unwrap();
        assert_eq!(after_status.spec.update_requests, 0);
        assert!(after_status.status.as_ref().unwrap().async_op_in_progress);

        let mut spec_only = after_status;
        spec_only.status = None;
        spec_only.spec.update_requests = 3;
        let after_spec = store.replace(&spec_only).await.unwrap();
        assert_eq!(after_spec.spec.update_requests, 3);
        assert!(after_spec.status.unwrap().async_op_in_progress);
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_sets_timestamp() {
        let store = MemoryStore::new();
        let mut obj = instance("a");
        obj.metadata.finalizers = Some(vec!["f".to_string()]);
        store.create(&obj).await.unwrap();

        store.delete(&key("a"), &DeleteParams::default()).await.unwrap();
        let pending = store.get(&key("a")).await.unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let patch = StorePatch::Merge(json!({"metadata": {"finalizers": []}}));
        store.patch(&key("a"), &patch).await.unwrap();
        assert!(store.get(&key("a")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_removes() {
        let store = MemoryStore::new();
        store.create(&instance("a")).await.unwrap();
        store.delete(&key("a"), &DeleteParams::default()).await.unwrap();
        assert!(store.get(&key("a")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_precondition_conflict() {
        let store = MemoryStore::new();
        store.create(&instance("a")).await.unwrap();
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: Some("999".to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        assert!(store.delete(&key("a"), &params).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_patch_checks_resource_version() {
        let store = MemoryStore::new();
        store.create(&instance("a")).await.unwrap();
        let patch = StorePatch::Merge(json!({
            "metadata": {"resourceVersion": "0"},
            "spec": {"updateRequests": 4}
        }));
        assert!(store.patch(&key("a"), &patch).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let store = MemoryStore::new();
        let mut a = instance("a");
        a.metadata.labels = Some(BTreeMap::from([("tier".to_string(), "gold".to_string())]));
        store.create(&a).await.unwrap();
        store.create(&instance("b")).await.unwrap();
        let mut other = instance("c");
        other.metadata.namespace = Some("other".to_string());
        store.create(&other).await.unwrap();

        assert_eq!(store.list(Some(NS), None).await.unwrap().len(), 2);
        assert_eq!(store.list(None, None).await.unwrap().len(), 3);
        let gold = store.list(None, Some("tier=gold")).await.unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_watch_receives_changes() {
        let store = MemoryStore::new();
        let mut events = store.watch(Some(NS));
        let created = store.create(&instance("a")).await.unwrap();
        let mut changed = created.clone();
        changed.spec.update_requests = 1;
        store.replace(&changed).await.unwrap();
        store.delete(&key("a"), &DeleteParams::default()).await.unwrap();

        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Modified(_)))));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Deleted(_)))));
    }

    #[test]
    fn test_merge_patch_removes_nulls() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &json!({"b": {"c": null, "e": 4}, "f": 5}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3, "e": 4}, "f": 5}));
    }
}
