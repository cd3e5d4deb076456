//! Integration tests for the Orka API client against a mock HTTP server.
//!
//! Covers deploy / get / delete / nodes / vm config mapping, bearer auth and
//! the single retry after a 401.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use orka_client::*;
use serde_json::json;

/// Hands out `t1`, then `t2` after each invalidation, and so on.
struct RotatingTokens {
    generation: AtomicUsize,
    invalidations: AtomicUsize,
}

impl RotatingTokens {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            generation: AtomicUsize::new(1),
            invalidations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenProvider for RotatingTokens {
    async fn get_token(&self) -> std::result::Result<String, TokenError> {
        Ok(format!("t{}", self.generation.load(Ordering::SeqCst)))
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

fn client(server: &Server, tokens: Arc<dyn TokenProvider>) -> OrkaClient {
    OrkaClient::new(&server.url(), "orka-default", tokens).unwrap()
}

#[tokio::test]
async fn test_deploy_sends_name_template_and_metadata() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/namespaces/orka-default/vms")
        .match_header("authorization", "Bearer secret")
        .match_body(Matcher::PartialJson(json!({
            "name": "ios-tc-ab12c",
            "vmConfig": "build-mac",
            "customMetadata": {"tc_image_id": "p1_build-mac"}
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"name": "build-mac-x1", "ip": "10.0.0.5", "ssh_port": 8822}).to_string(),
        )
        .create_async()
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("secret")));
    let mut metadata = HashMap::new();
    metadata.insert("tc_image_id".to_string(), "p1_build-mac".to_string());

    let resp = client.deploy("ios-tc-ab12c", "build-mac", &metadata).await.unwrap();
    assert!(resp.is_success());
    assert_eq!(resp.name, "build-mac-x1");
    assert_eq!(resp.ip, "10.0.0.5");
    assert_eq!(resp.ssh_port, 8822);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_deploy_error_surfaces_api_message() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/namespaces/orka-default/vms")
        .with_status(400)
        .with_body(json!({"errors": [{"message": "Cannot deploy more than 2 VMs"}]}).to_string())
        .create_async()
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("secret")));
    match client.deploy("vm-tc-ab12c", "build-mac", &HashMap::new()).await {
        Err(ClientError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert!(message.contains("Cannot deploy more than"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_retries_once_after_unauthorized() {
    let mut server = Server::new_async().await;
    let rejected = server
        .mock("GET", "/api/v1/namespaces/orka-default/nodes")
        .match_header("authorization", "Bearer t1")
        .with_status(401)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/api/v1/namespaces/orka-default/nodes")
        .match_header("authorization", "Bearer t2")
        .with_status(200)
        .with_body(
            json!({"items": [{"name": "mini-1", "availableCpu": 12, "availableMemory": "64G", "phase": "READY"}]})
                .to_string(),
        )
        .create_async()
        .await;

    let tokens = RotatingTokens::new();
    let client = client(&server, tokens.clone());
    let nodes = client.list_nodes().await.unwrap();

    assert_eq!(nodes.items.len(), 1);
    assert!(nodes.items[0].is_ready());
    assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
    rejected.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test]
async fn test_second_unauthorized_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/api/v1/namespaces/orka-default/vms/vm-1")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;

    let tokens = RotatingTokens::new();
    let client = client(&server, tokens.clone());
    let result = client.delete_vm("vm-1").await;

    assert!(matches!(result, Err(ClientError::Unauthorized)));
    assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_get_vm_lists_instances_for_template() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v1/namespaces/orka-default/vms")
        .match_query(Matcher::UrlEncoded("vmConfig".into(), "build-mac".into()))
        .with_status(200)
        .with_body(
            json!({"items": [
                {"name": "vm-a", "ip": "10.0.0.1", "ssh_port": 8822, "vmConfig": "build-mac"},
                {"name": "vm-b", "ip": "10.0.0.2", "ssh_port": 8823, "vmConfig": "build-mac"}
            ]})
            .to_string(),
        )
        .create_async()
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("secret")));
    let resp = client.get_vm("build-mac").await.unwrap();
    assert_eq!(resp.instance_ids(), vec!["vm-a", "vm-b"]);
}

#[tokio::test]
async fn test_delete_with_empty_body_succeeds() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/api/v1/namespaces/orka-default/vms/vm-a")
        .with_status(200)
        .create_async()
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("secret")));
    let resp = client.delete_vm("vm-a").await.unwrap();
    assert!(resp.is_success());
}

#[tokio::test]
async fn test_vm_config_lookup() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v1/vmconfigs/build-mac")
        .with_status(200)
        .with_body(
            json!({"items": [{"name": "build-mac", "cpu": 6, "memory": "16G", "tag": "m1", "tagRequired": true}]})
                .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/vmconfigs/missing")
        .with_status(404)
        .with_body(json!({"message": "not found"}).to_string())
        .create_async()
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("secret")));
    let config = client.vm_config("build-mac").await.unwrap().unwrap();
    assert_eq!(config.cpu, 6);
    assert_eq!(config.memory_gb(), 16.0);
    assert!(config.tag_required);

    assert!(client.vm_config("missing").await.unwrap().is_none());
}

#[test]
fn test_rejects_invalid_endpoint() {
    let result = OrkaClient::new("not a url", "ns", Arc::new(StaticTokenProvider::new("x")));
    assert!(matches!(result, Err(ClientError::InvalidEndpoint(_))));
}
