use sentra::core::SentraError;
use sentra::core::control::{self, ControlBackend};
use sentra::core::dispatch::{ApiRequest, envelope_ok};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;

struct FakeBackend;

#[async_trait::async_trait]
impl ControlBackend for FakeBackend {
    async fn dapi(&self, request: ApiRequest) -> Value {
        json!({ "data": { "function": request.function }, "error": 0 })
    }

    async fn dapi_forward(&self, node: &str, request: ApiRequest) -> Value {
        json!({ "data": { "node": node, "function": request.function }, "error": 0 })
    }

    async fn get_nodes(&self, _args: Value) -> Result<Value, SentraError> {
        Ok(json!({ "items": [{"name": "master-node", "type": "master"}], "totalItems": 1 }))
    }

    async fn get_health(&self, _filter: Value) -> Result<Value, SentraError> {
        Err(SentraError::NodeNotConnected("worker-9".into()))
    }
}

async fn start_socket() -> (std::path::PathBuf, broadcast::Sender<()>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.sock");
    // Keep the tempdir alive for the test duration.
    std::mem::forget(dir);
    let (shutdown_tx, _) = broadcast::channel(1);
    let rx = shutdown_tx.subscribe();
    let socket_path = path.clone();
    tokio::spawn(async move {
        control::run(socket_path, Arc::new(FakeBackend), rx).await.unwrap();
    });
    // Wait until the listener is up.
    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    (path, shutdown_tx)
}

#[tokio::test]
async fn test_control_socket_routes_dapi() {
    let (path, _shutdown) = start_socket().await;
    let reply = control::execute(
        &path,
        r#"dapi {"function": "/agents", "arguments": {}}"#,
    )
    .await
    .unwrap();
    assert_eq!(reply["error"], json!(0));
    assert_eq!(reply["data"]["function"], json!("/agents"));
}

#[tokio::test]
async fn test_control_socket_routes_dapi_forward() {
    let (path, _shutdown) = start_socket().await;
    let reply = control::execute(
        &path,
        r#"dapi_forward worker-2 {"function": "/syscheck"}"#,
    )
    .await
    .unwrap();
    assert_eq!(reply["data"]["node"], json!("worker-2"));
    assert_eq!(reply["data"]["function"], json!("/syscheck"));
}

#[tokio::test]
async fn test_control_socket_wraps_get_nodes_and_errors() {
    let (path, _shutdown) = start_socket().await;

    let reply = control::execute(&path, "get_nodes {}").await.unwrap();
    assert_eq!(reply["error"], json!(0));
    assert_eq!(reply["data"]["totalItems"], json!(1));

    // Backend errors surface as {message, error}.
    let reply = control::execute(&path, "get_health {}").await.unwrap();
    assert_eq!(reply["error"], json!(3018));
    assert!(reply["message"].as_str().unwrap().contains("worker-9"));
}

#[tokio::test]
async fn test_control_socket_rejects_unknown_command() {
    let (path, _shutdown) = start_socket().await;
    let reply = control::execute(&path, "frobnicate {}").await.unwrap();
    assert_eq!(reply["error"], json!(3008));
}

#[tokio::test]
async fn test_control_socket_envelope_shape() {
    // The ok-envelope helper produces the documented shape.
    assert_eq!(
        envelope_ok(json!([1, 2])),
        json!({ "data": [1, 2], "error": 0 })
    );
}
