// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for reconciler helper functions.

#[cfg(test)]
mod tests {
    use super::super::{
        broker_client_config, elapsed_since, generate_external_id, originating_identity,
        request_context, retry_window_expired,
    };
    use crate::context::Settings;
    use crate::crd::{
        ClusterBasicAuthConfig, ClusterServiceBroker, ClusterServiceBrokerAuthInfo,
        ClusterServiceBrokerSpec, CommonServiceBrokerSpec, ObjectReference, UserInfo,
    };
    use crate::osb::AuthConfig;
    use crate::reconcilers::testing::test_context;
    use crate::reconcilers::ReconcileError;
    use crate::status_reasons::REASON_AUTH_FAILED;
    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    // ========== Time helpers ==========

    #[test]
    fn test_elapsed_since() {
        let now = Utc::now();
        let then = (now - ChronoDuration::seconds(90)).to_rfc3339();
        let elapsed = elapsed_since(Some(&then), now).unwrap();
        assert_eq!(elapsed.as_secs(), 90);

        assert!(elapsed_since(None, now).is_none());
        assert!(elapsed_since(Some("yesterday"), now).is_none());
    }

    #[test]
    fn test_retry_window_expired() {
        let old = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
        assert!(retry_window_expired(Some(&old), Duration::from_secs(3600)));
        assert!(!retry_window_expired(Some(&old), Duration::from_secs(3 * 3600)));
        assert!(!retry_window_expired(None, Duration::ZERO));
    }

    // ========== External IDs and request metadata ==========

    #[test]
    fn test_generate_external_id_is_uuid_shaped() {
        let id = generate_external_id();
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups[2].starts_with('4'), "version nibble in {id}");
        assert!(
            matches!(groups[3].chars().next(), Some('8' | '9' | 'a' | 'b')),
            "variant bits in {id}"
        );
        assert_ne!(id, generate_external_id());
    }

    #[test]
    fn test_originating_identity() {
        assert!(originating_identity(None).is_none());

        let user = UserInfo {
            username: "alice".to_string(),
            uid: "u-1".to_string(),
            groups: vec!["devs".to_string()],
            extra: None,
        };
        let identity = originating_identity(Some(&user)).unwrap();
        assert_eq!(identity.platform, "kubernetes");
        assert_eq!(identity.value["username"], "alice");
        assert_eq!(identity.value["groups"][0], "devs");
        assert!(identity.value.get("extra").is_none());
    }

    #[test]
    fn test_request_context_uses_cluster_id() {
        let settings = Settings {
            cluster_id: "cluster-1".to_string(),
            ..Settings::default()
        };
        let context = request_context(&settings, "ns", "inst");
        assert_eq!(context.platform, "kubernetes");
        assert_eq!(context.namespace, "ns");
        assert_eq!(context.clusterid, "cluster-1");
        assert_eq!(context.instance_name, "inst");
    }

    // ========== Broker client configuration ==========

    fn basic_auth_broker(namespace: Option<&str>) -> ClusterServiceBroker {
        ClusterServiceBroker::new(
            "broker-a",
            ClusterServiceBrokerSpec {
                common: CommonServiceBrokerSpec {
                    url: "http://b.svc/".to_string(),
                    ..CommonServiceBrokerSpec::default()
                },
                auth_info: Some(ClusterServiceBrokerAuthInfo {
                    basic: Some(ClusterBasicAuthConfig {
                        secret_ref: Some(ObjectReference {
                            namespace: namespace.map(str::to_string),
                            name: "broker-auth".to_string(),
                        }),
                    }),
                    bearer: None,
                }),
            },
        )
    }

    #[tokio::test]
    async fn test_broker_client_config_reads_basic_auth() {
        let ctx = test_context();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("broker-auth".to_string()),
                namespace: Some("catalog".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(b"admin".to_vec())),
                ("password".to_string(), ByteString(b"s3cret".to_vec())),
            ])),
            ..Secret::default()
        };
        ctx.stores.secrets.create(&secret).await.unwrap();

        let config = broker_client_config(&ctx, &basic_auth_broker(Some("catalog")))
            .await
            .unwrap();
        assert_eq!(config.url, "http://b.svc/");
        assert_eq!(config.api_version, ctx.settings.osb_api_version);
        assert_eq!(
            config.auth,
            Some(AuthConfig::Basic {
                username: "admin".to_string(),
                password: "s3cret".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_broker_client_config_missing_secret_is_transient() {
        let ctx = test_context();
        let err = broker_client_config(&ctx, &basic_auth_broker(Some("catalog")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Transient {
                reason: REASON_AUTH_FAILED,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_broker_client_config_rejects_malformed_settings() {
        let ctx = test_context();
        let err = broker_client_config(&ctx, &basic_auth_broker(None))
            .await
            .unwrap_err();
        assert!(err.is_terminal(), "cluster broker secretRef needs a namespace");

        let mut broker = basic_auth_broker(Some("catalog"));
        broker.spec.auth_info = None;
        broker.spec.common.ca_bundle = Some("not base64!".to_string());
        let err = broker_client_config(&ctx, &broker).await.unwrap_err();
        assert_eq!(err.reason(), REASON_AUTH_FAILED);
        assert!(err.is_terminal());
    }
}
