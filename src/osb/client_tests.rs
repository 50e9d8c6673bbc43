// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the HTTP broker client

#[cfg(test)]
mod tests {
    use crate::osb::client::HttpBrokerClient;
    use crate::osb::errors::OsbError;
    use crate::osb::types::{
        BindRequest, DeprovisionRequest, LastOperationRequest, LastOperationState,
        OriginatingIdentity, ProvisionRequest, RequestContext, UnbindRequest,
        UpdateInstanceRequest,
    };
    use crate::osb::{AuthConfig, BrokerClient, ClientConfig};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client_for(server: &MockServer, auth: Option<AuthConfig>) -> HttpBrokerClient {
        let mut config = ClientConfig::new("test-broker", server.uri());
        config.auth = auth;
        HttpBrokerClient::new(&config).unwrap()
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            instance_id: "inst-1".to_string(),
            accepts_incomplete: true,
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            organization_guid: "cluster-1".to_string(),
            space_guid: "ns-1".to_string(),
            parameters: json!({"size": "small"}).as_object().cloned(),
            context: Some(RequestContext {
                platform: "kubernetes".to_string(),
                namespace: "ns-1".to_string(),
                clusterid: "cluster-1".to_string(),
                instance_name: "db".to_string(),
            }),
            originating_identity: None,
        }
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let config = ClientConfig::new("b", "not a url");
        assert!(matches!(
            HttpBrokerClient::new(&config),
            Err(OsbError::Config(_))
        ));
    }

    #[test]
    fn test_new_rejects_invalid_ca_bundle() {
        let mut config = ClientConfig::new("b", "https://broker.example.com");
        config.ca_bundle = Some(b"garbage".to_vec());
        assert!(matches!(
            HttpBrokerClient::new(&config),
            Err(OsbError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_sends_version_and_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .and(header("X-Broker-API-Version", "2.13"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "services": [{
                    "id": "svc-1",
                    "name": "db",
                    "description": "a database",
                    "bindable": true,
                    "plan_updateable": true,
                    "plans": [{"id": "plan-1", "name": "small", "description": "s", "free": false}]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            Some(AuthConfig::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        );
        let catalog = client.get_catalog().await.unwrap();
        assert_eq!(catalog.services.len(), 1);
        let service = &catalog.services[0];
        assert!(service.plan_updatable);
        assert_eq!(service.plans[0].free, Some(false));
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .and(header("Authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"services": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            Some(AuthConfig::Bearer {
                token: "s3cret".to_string(),
            }),
        );
        assert!(client.get_catalog().await.unwrap().services.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_error_body_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "Unauthorized",
                "description": "bad credentials"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server, None).get_catalog().await.unwrap_err();
        assert_eq!(
            err,
            OsbError::Http {
                status: 401,
                error: Some("Unauthorized".to_string()),
                description: Some("bad credentials".to_string()),
            }
        );
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_catalog_garbage_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, None).get_catalog().await.unwrap_err();
        assert!(matches!(err, OsbError::Decode { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_provision_sync_body_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .and(query_param("accepts_incomplete", "true"))
            .and(body_json(json!({
                "service_id": "svc-1",
                "plan_id": "plan-1",
                "organization_guid": "cluster-1",
                "space_guid": "ns-1",
                "parameters": {"size": "small"},
                "context": {
                    "platform": "kubernetes",
                    "namespace": "ns-1",
                    "clusterid": "cluster-1",
                    "instance_name": "db"
                }
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"dashboard_url": "https://dash/inst-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server, None)
            .provision_instance(&provision_request())
            .await
            .unwrap();
        assert!(!response.is_async);
        assert_eq!(response.dashboard_url.as_deref(), Some("https://dash/inst-1"));
        assert_eq!(response.operation_key, None);
    }

    #[tokio::test]
    async fn test_provision_empty_body_is_sync_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let response = client_for(&server, None)
            .provision_instance(&provision_request())
            .await
            .unwrap();
        assert!(!response.is_async);
    }

    #[tokio::test]
    async fn test_provision_async_returns_operation() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"operation": "op-42"})))
            .mount(&server)
            .await;

        let response = client_for(&server, None)
            .provision_instance(&provision_request())
            .await
            .unwrap();
        assert!(response.is_async);
        assert_eq!(response.operation_key.as_deref(), Some("op-42"));
    }

    #[tokio::test]
    async fn test_provision_server_error_leaves_state_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .provision_instance(&provision_request())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.leaves_remote_state_unknown());
    }

    #[tokio::test]
    async fn test_provision_rejects_missing_ids_without_sending() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let mut request = provision_request();
        request.plan_id.clear();
        let err = client_for(&server, None)
            .provision_instance(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, OsbError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_originating_identity_header() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .and(header_exists("X-Broker-API-Originating-Identity"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = provision_request();
        request.originating_identity = Some(OriginatingIdentity {
            platform: "kubernetes".to_string(),
            value: json!({"username": "alice", "uid": "u-1"}),
        });
        client_for(&server, None)
            .provision_instance(&request)
            .await
            .unwrap();

        let received: Vec<Request> = server.received_requests().await.unwrap();
        let raw = received[0]
            .headers
            .get("X-Broker-API-Originating-Identity")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let (platform, encoded) = raw.split_once(' ').unwrap();
        assert_eq!(platform, "kubernetes");
        let decoded: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded["username"], "alice");
    }

    #[tokio::test]
    async fn test_update_sends_only_changed_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v2/service_instances/inst-1"))
            .and(body_json(json!({
                "service_id": "svc-1",
                "plan_id": "plan-2",
                "previous_values": {"plan_id": "plan-1", "service_id": "svc-1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let request = UpdateInstanceRequest {
            instance_id: "inst-1".to_string(),
            accepts_incomplete: true,
            service_id: "svc-1".to_string(),
            plan_id: Some("plan-2".to_string()),
            parameters: None,
            previous_values: Some(crate::osb::types::PreviousValues {
                plan_id: "plan-1".to_string(),
                service_id: "svc-1".to_string(),
            }),
            context: None,
            originating_identity: None,
        };
        let response = client_for(&server, None)
            .update_instance(&request)
            .await
            .unwrap();
        assert!(!response.is_async);
    }

    #[tokio::test]
    async fn test_deprovision_gone_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/service_instances/inst-1"))
            .and(query_param("service_id", "svc-1"))
            .and(query_param("plan_id", "plan-1"))
            .respond_with(ResponseTemplate::new(410).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let request = DeprovisionRequest {
            instance_id: "inst-1".to_string(),
            accepts_incomplete: true,
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            originating_identity: None,
        };
        let response = client_for(&server, None)
            .deprovision_instance(&request)
            .await
            .unwrap();
        assert!(!response.is_async);
    }

    #[tokio::test]
    async fn test_deprovision_async() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/service_instances/inst-1"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"operation": "del-1"})))
            .mount(&server)
            .await;

        let request = DeprovisionRequest {
            instance_id: "inst-1".to_string(),
            accepts_incomplete: true,
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            originating_identity: None,
        };
        let response = client_for(&server, None)
            .deprovision_instance(&request)
            .await
            .unwrap();
        assert!(response.is_async);
        assert_eq!(response.operation_key.as_deref(), Some("del-1"));
    }

    #[tokio::test]
    async fn test_last_operation_query_and_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/service_instances/inst-1/last_operation"))
            .and(query_param("operation", "op-42"))
            .and(query_param("service_id", "svc-1"))
            .and(query_param("plan_id", "plan-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "in progress",
                "description": "50% done"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = LastOperationRequest {
            instance_id: "inst-1".to_string(),
            binding_id: None,
            service_id: Some("svc-1".to_string()),
            plan_id: Some("plan-1".to_string()),
            operation_key: Some("op-42".to_string()),
            originating_identity: None,
        };
        let response = client_for(&server, None)
            .poll_last_operation(&request)
            .await
            .unwrap();
        assert_eq!(response.state, LastOperationState::InProgress);
        assert_eq!(response.description.as_deref(), Some("50% done"));
    }

    #[tokio::test]
    async fn test_last_operation_gone_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/service_instances/inst-1/last_operation"))
            .respond_with(ResponseTemplate::new(410).set_body_json(json!({})))
            .mount(&server)
            .await;

        let request = LastOperationRequest {
            instance_id: "inst-1".to_string(),
            ..Default::default()
        };
        let err = client_for(&server, None)
            .poll_last_operation(&request)
            .await
            .unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn test_binding_last_operation_requires_binding_id() {
        let server = MockServer::start().await;
        let request = LastOperationRequest {
            instance_id: "inst-1".to_string(),
            ..Default::default()
        };
        let err = client_for(&server, None)
            .poll_binding_last_operation(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, OsbError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_bind_returns_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1/service_bindings/bind-1"))
            .and(body_json(json!({
                "service_id": "svc-1",
                "plan_id": "plan-1",
                "app_guid": "ns-1",
                "bind_resource": {"app_guid": "ns-1"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "credentials": {"user": "u", "password": "p"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = BindRequest {
            binding_id: "bind-1".to_string(),
            instance_id: "inst-1".to_string(),
            accepts_incomplete: false,
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            app_guid: Some("ns-1".to_string()),
            parameters: None,
            context: None,
            originating_identity: None,
        };
        let response = client_for(&server, None).bind(&request).await.unwrap();
        assert!(!response.is_async);
        let credentials = response.credentials.unwrap();
        assert_eq!(credentials["user"], "u");
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1/service_bindings/bind-1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({})))
            .mount(&server)
            .await;

        let request = BindRequest {
            binding_id: "bind-1".to_string(),
            instance_id: "inst-1".to_string(),
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            ..Default::default()
        };
        let err = client_for(&server, None).bind(&request).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unbind_gone_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/service_instances/inst-1/service_bindings/bind-1"))
            .and(query_param("service_id", "svc-1"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let request = UnbindRequest {
            binding_id: "bind-1".to_string(),
            instance_id: "inst-1".to_string(),
            accepts_incomplete: false,
            service_id: "svc-1".to_string(),
            plan_id: "plan-1".to_string(),
            originating_identity: None,
        };
        let response = client_for(&server, None).unbind(&request).await.unwrap();
        assert!(!response.is_async);
    }

    #[tokio::test]
    async fn test_base_path_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brokers/a/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"services": []})))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("b", format!("{}/brokers/a/", server.uri()));
        let client = HttpBrokerClient::new(&config).unwrap();
        client.get_catalog().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_not_ambiguous() {
        // Nothing listens on port 1.
        let config = ClientConfig::new("b", "http://127.0.0.1:1");
        let client = HttpBrokerClient::new(&config).unwrap();
        let err = client.get_catalog().await.unwrap_err();
        assert!(matches!(
            err,
            OsbError::Transport {
                request_sent: false,
                ..
            }
        ));
    }
}
