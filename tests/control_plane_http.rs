//! Integration tests for the HTTP control-plane client using wiremock
//!
//! These tests verify token headers, request bodies and envelope handling
//! against mocked `/api/agent/*` endpoints.

use cloudrec_agent::control::{ControlPlane, HttpControlPlane, ResourceBatch, Session};
use cloudrec_agent::error::ControlPlaneError;
use cloudrec_agent::resource::ResourceBuilder;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLATFORM: &str = "DEMO_CLOUD";

fn client(server: &MockServer) -> HttpControlPlane {
    HttpControlPlane::new(
        &server.uri(),
        PLATFORM,
        vec!["hangzhou".to_string()],
        Session::new("agent-1", Some("once-123".to_string())),
    )
    .expect("client should build")
}

async fn mount_registry(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/api/agent/registry"))
        .and(header("ONCETOKEN", "once-123"))
        .and(body_partial_json(json!({ "platform": PLATFORM, "agentName": "agent-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "msg": "success",
            "content": { "persistentToken": token }
        })))
        .expect(1)
        .mount(server)
        .await;
}

/// Registered client against a fresh mock server
async fn registered() -> (MockServer, HttpControlPlane) {
    let server = MockServer::start().await;
    mount_registry(&server, "pt-1").await;
    let client = client(&server);
    client.register().await.expect("registration should succeed");
    (server, client)
}

async fn last_body(server: &MockServer, endpoint: &str) -> Value {
    let requests = server.received_requests().await.unwrap_or_default();
    let request = requests
        .iter()
        .rev()
        .find(|r| r.url.path() == endpoint)
        .expect("request should have been received");
    serde_json::from_slice(&request.body).expect("body should be JSON")
}

mod registration {
    use super::*;

    #[tokio::test]
    async fn test_register_stores_persistent_token() {
        let (_server, client) = registered().await;
        assert!(client.is_registered().await);
        assert_eq!(client.session().token().await.unwrap(), "pt-1");
    }

    #[tokio::test]
    async fn test_rejected_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/registry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 500,
                "msg": "token expired"
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client.register().await.unwrap_err();
        match err.downcast_ref::<ControlPlaneError>() {
            Some(ControlPlaneError::Rejected { code, msg }) => {
                assert_eq!(*code, 500);
                assert_eq!(msg, "token expired");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!client.is_registered().await);
    }

    #[tokio::test]
    async fn test_unauthorized_drops_session() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/listCollectorTask"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let err = client.list_tasks().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ControlPlaneError>(),
            Some(ControlPlaneError::Status(401))
        ));
        assert!(!client.is_registered().await);
    }
}

mod accounts {
    use super::*;

    #[tokio::test]
    async fn test_list_accounts_with_free_count() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/listCloudAccount"))
            .and(header("PERSISTENTTOKEN", "pt-1"))
            .and(body_partial_json(json!({
                "platform": PLATFORM,
                "sites": ["hangzhou"],
                "freeCloudAccountCount": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "content": [
                    { "cloudAccountId": "a-1", "platform": PLATFORM, "resourceTypeList": ["ECS"] },
                    { "cloudAccountId": "a-2", "platform": PLATFORM, "taskId": 4 }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let accounts = client.list_accounts(&[], Some(3)).await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].resource_type_list, vec!["ECS"]);
        assert_eq!(accounts[1].task_id, 4);
    }

    #[tokio::test]
    async fn test_list_accounts_by_task() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/listCloudAccount"))
            .and(body_partial_json(json!({ "taskIds": [7, 8] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "content": [{ "cloudAccountId": "a-7", "platform": PLATFORM, "taskId": 7 }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let accounts = client.list_accounts(&[7, 8], None).await.unwrap();
        assert_eq!(accounts[0].cloud_account_id, "a-7");

        let body = last_body(&server, "/api/agent/listCloudAccount").await;
        assert!(body.get("freeCloudAccountCount").is_none());
    }

    #[tokio::test]
    async fn test_empty_body_means_no_tasks() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/listCollectorTask"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(client.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_tasks() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/listCollectorTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "content": [{ "taskId": 11, "cloudAccountId": "a-1", "taskType": "RESCAN" }]
            })))
            .mount(&server)
            .await;

        let tasks = client.list_tasks().await.unwrap();
        assert_eq!(tasks[0].task_id, 11);
        assert_eq!(tasks[0].task_type.as_deref(), Some("RESCAN"));
    }
}

mod submission {
    use super::*;

    fn batch() -> ResourceBatch {
        let instance = ResourceBuilder::new()
            .resource_id(Some("i-1".to_string()))
            .resource_name(Some("web-1".to_string()))
            .region_id("demo-east-1")
            .instance(json!({ "InstanceId": "i-1" }))
            .build()
            .unwrap();
        ResourceBatch {
            platform: PLATFORM.to_string(),
            version: "20240601120000".to_string(),
            cloud_account_id: "a-1".to_string(),
            resource_type: "DEMO_INSTANCE".to_string(),
            resource_type_name: "Demo Instance".to_string(),
            resource_group_type: "COMPUTE".to_string(),
            doc_link: String::new(),
            instances: vec![instance],
        }
    }

    #[tokio::test]
    async fn test_push_sends_batch_as_data_string() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/resource"))
            .and(header("PERSISTENTTOKEN", "pt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
            .expect(1)
            .mount(&server)
            .await;

        client.push_resources(&batch()).await.unwrap();

        let body = last_body(&server, "/api/agent/resource").await;
        let data: Value = serde_json::from_str(body["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["cloudAccountId"], "a-1");
        assert_eq!(data["version"], "20240601120000");
        assert_eq!(data["resourceInstancesAll"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_server_error() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/resource"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client.push_resources(&batch()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ControlPlaneError>(),
            Some(ControlPlaneError::Status(503))
        ));
        // Server errors keep the session
        assert!(client.is_registered().await);
    }

    #[tokio::test]
    async fn test_finish_signal_body() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/acceptRunningFinishSignal"))
            .and(body_partial_json(json!({ "cloudAccountId": "a-1", "taskId": 7 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
            .expect(1)
            .mount(&server)
            .await;

        client.send_finish_signal("a-1", 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_supported_resources_body() {
        let (server, client) = registered().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/acceptSupportResourceType"))
            .and(body_partial_json(json!({
                "platform": PLATFORM,
                "resourceList": [{
                    "resourceType": "DEMO_INSTANCE",
                    "resourceTypeName": "Demo Instance",
                    "resourceGroupType": "COMPUTE"
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
            .expect(1)
            .mount(&server)
            .await;

        let resources = cloudrec_agent::demo::resources()
            .into_iter()
            .take(1)
            .map(|r| r.support_entry())
            .collect();
        client.send_supported_resources(resources).await.unwrap();
    }
}
