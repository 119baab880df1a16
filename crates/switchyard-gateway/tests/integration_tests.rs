//! Integration tests for the switchyard gateway.
//!
//! These run a real gateway on OS-assigned ports and talk to it with real
//! clients over both ingress paths: persistent WebSocket connections and the
//! stateless HTTP fallback.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    ClientConfig, ClientDelegate, Connection, GatewayClient, GatewayError, Method, Request,
    Response,
};
use switchyard_gateway::{Gateway, GatewayConfig, GatewayHandle};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

const AUTH_KEY: &str = "test-key";

/// Start a gateway on OS-assigned ports.
async fn start_gateway() -> GatewayHandle {
    let config = GatewayConfig::new("127.0.0.1", 0, 0, AUTH_KEY);
    Gateway::start(config).await.expect("gateway start")
}

fn client_config(handle: &GatewayHandle) -> ClientConfig {
    let mut config = ClientConfig::new("127.0.0.1", handle.socket_addr().port(), AUTH_KEY);
    config.connect_retry_timeout = Duration::from_millis(50);
    config
}

/// Delegate for a server process hosting instances: registers them on every
/// connect and answers forwarded server messages.
struct InstanceServer {
    pairs: Vec<(&'static str, &'static str)>,
}

#[async_trait]
impl ClientDelegate for InstanceServer {
    async fn on_start(&self, conn: &Arc<Connection>) {
        let pairs: Vec<Value> = self
            .pairs
            .iter()
            .map(|(instance, group)| json!({"instance_name": instance, "group_name": group}))
            .collect();
        conn.request(Method::Register, json!(pairs))
            .await
            .expect("register");
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request.method {
            Method::Get => Response::ok(request.id, json!({"value": 42})),
            Method::Call => Response::ok(request.id, json!({"result": "called", "echo": request.data})),
            Method::Available => Response::ok(request.id, json!(true)),
            Method::Lock | Method::Unlock | Method::Set => Response::ok(request.id, Value::Null),
            Method::Metadata => Response::ok(request.id, json!({"methods": ["run"]})),
            _ => GatewayError::InvalidMethod {
                name: request.method.name().to_string(),
            }
            .to_response(request.id),
        }
    }
}

/// Delegate whose handler never answers, for in-flight failure tests.
struct StalledServer {
    name: &'static str,
}

#[async_trait]
impl ClientDelegate for StalledServer {
    async fn on_start(&self, conn: &Arc<Connection>) {
        conn.request(
            Method::Register,
            json!({"instance_name": self.name, "group_name": "stalled"}),
        )
        .await
        .expect("register");
    }

    async fn handle_request(&self, request: Request) -> Response {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Response::ok(request.id, Value::Null)
    }
}

/// Wait until a group shows up in LIST (registration runs async in
/// `on_start`).
async fn wait_for_group(client: &GatewayClient, group: &str) {
    for _ in 0..100 {
        if client.list(Some(group)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("group {} never appeared in LIST", group);
}

/// Wait until a group is gone from LIST.
async fn wait_for_group_gone(client: &GatewayClient, group: &str) {
    for _ in 0..100 {
        if client.list(Some(group)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("group {} never disappeared from LIST", group);
}

#[tokio::test]
async fn test_register_and_forward_roundtrip() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("search-svc", "search")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "search").await;

    let response = caller
        .request(Method::Call, json!({"instance": "search-svc", "args": [1]}))
        .await
        .unwrap();
    assert_eq!(response.data["result"], "called");
    // The payload the server saw is the payload the caller sent.
    assert_eq!(response.data["echo"]["args"], json!([1]));

    let response = caller
        .request(Method::Get, json!({"instance": "search-svc"}))
        .await
        .unwrap();
    assert_eq!(response.data, json!({"value": 42}));

    caller.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_instance_never_blocks() {
    let mut gateway = start_gateway().await;
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;

    for _ in 0..3 {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            caller.request(Method::Call, json!({"instance": "ghost"})),
        )
        .await
        .expect("request must not hang");

        match result {
            Err(GatewayError::Remote { error, .. }) => {
                assert_eq!(error, "InstanceNotFoundError");
            }
            other => panic!("Expected InstanceNotFoundError, got: {:?}", other),
        }
    }

    caller.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let mut gateway = start_gateway().await;

    let first = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("dup-svc", "dup")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "dup").await;

    let result = caller.register("dup-svc", "dup").await;
    match result {
        Err(GatewayError::Remote { error, .. }) => {
            assert_eq!(error, "InstanceAlreadyRegisteredError");
        }
        other => panic!("Expected InstanceAlreadyRegisteredError, got: {:?}", other),
    }

    // The original owner still serves requests.
    let response = caller
        .request(Method::Get, json!({"instance": "dup-svc"}))
        .await
        .unwrap();
    assert_eq!(response.data["value"], 42);

    caller.stop().await;
    first.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_on_server_disconnect() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("gone-svc", "gone"), ("gone-too", "gone")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "gone").await;

    server.stop().await;
    wait_for_group_gone(&caller, "gone").await;

    // Instances are gone from the registry.
    let result = caller
        .request(Method::Call, json!({"instance": "gone-svc"}))
        .await;
    match result {
        Err(GatewayError::Remote { error, .. }) => {
            assert_eq!(error, "InstanceNotFoundError");
        }
        other => panic!("Expected InstanceNotFoundError, got: {:?}", other),
    }

    // The emptied group is gone too.
    let result = caller.list(Some("gone")).await;
    match result {
        Err(GatewayError::Remote { error, .. }) => {
            assert_eq!(error, "GroupNotFoundError");
        }
        other => panic!("Expected GroupNotFoundError, got: {:?}", other),
    }

    caller.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_in_flight_request_fails_when_server_dies() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        StalledServer { name: "stall-svc" },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "stalled").await;

    let pending = {
        let conn = caller.connection().unwrap();
        tokio::spawn(async move {
            conn.request(Method::Call, json!({"instance": "stall-svc"}))
                .await
        })
    };

    // Let the forwarded request reach the stalled handler, then kill the
    // owning process.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("in-flight request must not hang")
        .unwrap();
    assert!(matches!(result, Err(GatewayError::ServerConnectionLost)));

    caller.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_list_all_groups() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("a-svc", "alpha"), ("b-svc", "beta")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "alpha").await;
    wait_for_group(&caller, "beta").await;

    let response = caller.list(None).await.unwrap();
    assert_eq!(response.data["alpha"], json!(["a-svc"]));
    assert_eq!(response.data["beta"], json!(["b-svc"]));

    caller.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_available_and_deregister() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("avail-svc", "avail")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "avail").await;

    let response = caller.available("avail-svc").await.unwrap();
    assert_eq!(response.data, json!(true));

    // Deregistration over the server's own connection.
    server.deregister("avail-svc").await.unwrap();

    let result = caller.available("avail-svc").await;
    match result {
        Err(GatewayError::Remote { error, .. }) => {
            assert_eq!(error, "InstanceNotFoundError");
        }
        other => panic!("Expected InstanceNotFoundError, got: {:?}", other),
    }

    caller.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_handshake_with_bad_auth_key_closed_with_policy_violation() {
    let mut gateway = start_gateway().await;

    let url = format!(
        "ws://127.0.0.1:{}/socket?auth_key=wrong",
        gateway.socket_addr().port()
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    // The gateway accepts the handshake, then closes with 1008.
    let mut saw_policy_close = false;
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Close(Some(frame)) = message {
            assert_eq!(frame.code, CloseCode::Policy);
            saw_policy_close = true;
            break;
        }
    }
    assert!(saw_policy_close, "expected a 1008 close frame");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_malformed_socket_frame_gets_error_response() {
    let mut gateway = start_gateway().await;

    let url = format!(
        "ws://127.0.0.1:{}/socket?auth_key={}",
        gateway.socket_addr().port(),
        AUTH_KEY
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(
        r#"{"id": 5, "method": "BOGUS", "data": {}}"#.to_string(),
    ))
    .await
    .unwrap();

    let reply = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            other => panic!("Expected a text reply, got: {:?}", other),
        }
    };
    let value: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["id"], 5);
    assert_eq!(value["status"], "ERROR");
    assert_eq!(value["data"]["error"], "InvalidMessageError");

    gateway.shutdown().await;
}

// ============================================================================
// HTTP fallback
// ============================================================================

fn http_url(gateway: &GatewayHandle) -> String {
    format!("http://127.0.0.1:{}/", gateway.http_addr().port())
}

#[tokio::test]
async fn test_http_rejects_non_post() {
    let mut gateway = start_gateway().await;

    let response = reqwest::get(http_url(&gateway)).await.unwrap();
    assert_eq!(response.status(), 405);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_http_auth_gate() {
    let mut gateway = start_gateway().await;
    let client = reqwest::Client::new();

    // No key at all.
    let response = client
        .post(http_url(&gateway))
        .json(&json!({"method": "LIST", "data": {"group": null}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"status": 1, "data": "Authentication required"}));

    // Wrong key in the header.
    let response = client
        .post(http_url(&gateway))
        .header("Authentication", "AuthKey wrong")
        .json(&json!({"method": "LIST", "data": {"group": null}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_http_list_with_header_auth() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("http-svc", "http")],
        },
    );
    let probe = GatewayClient::start(client_config(&gateway), ());
    probe.wait_connected().await;
    wait_for_group(&probe, "http").await;

    let client = reqwest::Client::new();
    let response = client
        .post(http_url(&gateway))
        .header("Authentication", format!("AuthKey {}", AUTH_KEY))
        .json(&json!({"method": "LIST", "data": {"group": "http"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"], json!({"http": ["http-svc"]}));
    // Internal fields are stripped.
    assert!(body.get("id").is_none());
    assert!(body.get("encoding").is_none());

    // A body with no data key at all is treated as a null payload, which for
    // LIST means the whole group map.
    let response = client
        .post(http_url(&gateway))
        .header("Authentication", format!("AuthKey {}", AUTH_KEY))
        .json(&json!({"method": "LIST"}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"], json!({"http": ["http-svc"]}));

    probe.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_http_call_with_query_auth_and_error_stringification() {
    let mut gateway = start_gateway().await;

    let server = GatewayClient::start(
        client_config(&gateway),
        InstanceServer {
            pairs: vec![("q-svc", "q")],
        },
    );
    let probe = GatewayClient::start(client_config(&gateway), ());
    probe.wait_connected().await;
    wait_for_group(&probe, "q").await;

    let client = reqwest::Client::new();
    let url = format!("{}?auth_key={}", http_url(&gateway), AUTH_KEY);

    // Forwarded CALL through the HTTP path.
    let response = client
        .post(&url)
        .json(&json!({"method": "CALL", "data": {"instance": "q-svc"}}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"]["result"], "called");

    // Errors come back stringified, never as structured objects.
    let response = client
        .post(&url)
        .json(&json!({"method": "CALL", "data": {"instance": "ghost"}}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 2);
    let data = body["data"].as_str().expect("error data must be a string");
    assert!(data.starts_with("InstanceNotFoundError:"));

    probe.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_http_refuses_register_and_malformed_bodies() {
    let mut gateway = start_gateway().await;
    let client = reqwest::Client::new();
    let url = format!("{}?auth_key={}", http_url(&gateway), AUTH_KEY);

    // REGISTER needs a persistent connection.
    let response = client
        .post(&url)
        .json(&json!({"method": "REGISTER", "data": {"instance_name": "a", "group_name": "g"}}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 1);
    assert!(body["data"].as_str().unwrap().starts_with("InvalidMethodError:"));

    // Unknown method name.
    let response = client
        .post(&url)
        .json(&json!({"method": "EXPLODE", "data": {}}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 1);
    assert!(body["data"].as_str().unwrap().starts_with("InvalidMethodError:"));

    // Missing method key.
    let response = client
        .post(&url)
        .json(&json!({"data": {}}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 1);
    assert!(body["data"].as_str().unwrap().starts_with("InvalidMessageError:"));

    // Unparsable body.
    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 1);
    assert!(body["data"].as_str().unwrap().starts_with("InvalidMessageError:"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_server_reregisters_after_reconnect() {
    let mut gateway = start_gateway().await;

    // A longer retry delay keeps the deregistered window wide enough for the
    // polling below to observe it.
    let mut server_config = client_config(&gateway);
    server_config.connect_retry_timeout = Duration::from_millis(300);

    let server = GatewayClient::start(
        server_config,
        InstanceServer {
            pairs: vec![("phoenix-svc", "phoenix")],
        },
    );
    let caller = GatewayClient::start(client_config(&gateway), ());
    caller.wait_connected().await;
    wait_for_group(&caller, "phoenix").await;

    // Sever the server's link without stopping it; the reconnect loop must
    // bring the instance back via on_start.
    server.connection().unwrap().stop().await;
    wait_for_group_gone(&caller, "phoenix").await;
    wait_for_group(&caller, "phoenix").await;

    let response = caller
        .request(Method::Get, json!({"instance": "phoenix-svc"}))
        .await
        .unwrap();
    assert_eq!(response.data["value"], 42);

    caller.stop().await;
    server.stop().await;
    gateway.shutdown().await;
}

/// Delegate that registers one instance and counts the UNLOCK requests it
/// receives.
struct UnlockCountingServer {
    name: &'static str,
    unlocks: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl ClientDelegate for UnlockCountingServer {
    async fn on_start(&self, conn: &Arc<Connection>) {
        conn.request(
            Method::Register,
            json!({"instance_name": self.name, "group_name": "locked"}),
        )
        .await
        .expect("register");
    }

    async fn handle_request(&self, request: Request) -> Response {
        if request.method == Method::Unlock {
            self.unlocks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Response::ok(request.id, Value::Null)
    }
}

#[tokio::test]
async fn test_disconnected_locker_gets_unlocked() {
    let mut gateway = start_gateway().await;

    let unlocks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let server = GatewayClient::start(
        client_config(&gateway),
        UnlockCountingServer {
            name: "vault-svc",
            unlocks: unlocks.clone(),
        },
    );

    let locker = GatewayClient::start(client_config(&gateway), ());
    locker.wait_connected().await;
    wait_for_group(&locker, "locked").await;

    locker
        .request(Method::Lock, json!({"instance": "vault-svc"}))
        .await
        .unwrap();

    // The locker drops without unlocking; the gateway must unlock on its
    // behalf.
    locker.stop().await;

    for _ in 0..100 {
        if unlocks.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(unlocks.load(std::sync::atomic::Ordering::SeqCst), 1);

    server.stop().await;
    gateway.shutdown().await;
}
