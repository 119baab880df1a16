//! Reconnecting gateway client.
//!
//! [`GatewayClient`] is the shared base for any process that needs a durable
//! relationship with the gateway: instance servers register names and answer
//! forwarded requests, calling clients issue them. Both get the same
//! connect/reconnect loop, run as a supervised background task so the host
//! stays free to do other work. [`GatewayClient::stop`] is the only path out
//! of the loop; every other disconnect reconnects after a fixed delay.

use crate::connection::{Connection, RequestHandler};
use crate::error::{GatewayError, Result};
use crate::protocol::{Method, Request, Response};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default delay between reconnection attempts.
pub const DEFAULT_CONNECT_RETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection parameters for a gateway client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub auth_key: String,
    /// Delay between reconnection attempts.
    pub connect_retry_timeout: Duration,
}

impl ClientConfig {
    /// Create a config with the default retry timeout.
    pub fn new(host: impl Into<String>, port: u16, auth_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            auth_key: auth_key.into(),
            connect_retry_timeout: DEFAULT_CONNECT_RETRY_TIMEOUT,
        }
    }

    /// WebSocket URL for the gateway socket endpoint.
    pub fn url(&self) -> String {
        format!(
            "ws://{}:{}/socket?auth_key={}",
            self.host, self.port, self.auth_key
        )
    }
}

/// Hooks a host application plugs into the client lifecycle.
///
/// All methods have default implementations; a pure calling client can use
/// `()` as its delegate. Instance servers implement `handle_request` to
/// answer forwarded server messages and `on_start` to (re-)register their
/// instances after every connect.
#[async_trait]
pub trait ClientDelegate: Send + Sync + 'static {
    /// Called after each successful connect, before any request is issued.
    async fn on_start(&self, _conn: &Arc<Connection>) {}

    /// Called once when the client is stopped for good.
    async fn on_stop(&self) {}

    /// Handle a request forwarded to this process by the gateway.
    async fn handle_request(&self, request: Request) -> Response {
        GatewayError::InvalidMethod {
            name: request.method.name().to_string(),
        }
        .to_response(request.id)
    }
}

/// Delegate for clients that only issue requests.
#[async_trait]
impl ClientDelegate for () {}

/// Bridges the connection's handler seam onto the delegate.
struct DelegateHandler {
    delegate: Arc<dyn ClientDelegate>,
}

#[async_trait]
impl RequestHandler for DelegateHandler {
    async fn handle_request(&self, request: Request) -> Response {
        self.delegate.handle_request(request).await
    }
}

struct ClientShared {
    config: ClientConfig,
    delegate: Arc<dyn ClientDelegate>,
    conn: std::sync::Mutex<Option<Arc<Connection>>>,
    connected_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// Client that maintains a durable connection to the gateway.
pub struct GatewayClient {
    shared: Arc<ClientShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Start the connect/serve loop as a background task.
    ///
    /// Connection failures are retried indefinitely with the configured
    /// delay; they are never surfaced to the caller.
    pub fn start<D: ClientDelegate>(config: ClientConfig, delegate: D) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ClientShared {
            config,
            delegate: Arc::new(delegate),
            conn: std::sync::Mutex::new(None),
            connected_tx,
            shutdown_tx,
        });

        let task = tokio::spawn(Self::run(shared.clone(), shutdown_rx));

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(shared: Arc<ClientShared>, mut shutdown_rx: watch::Receiver<bool>) {
        let url = shared.config.url();
        let retry = shared.config.connect_retry_timeout;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let ws = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = tokio_tungstenite::connect_async(url.as_str()) => match result {
                    Ok((ws, _)) => ws,
                    Err(e) => {
                        warn!("gateway connect failed: {}; retrying in {:?}", e, retry);
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = tokio::time::sleep(retry) => continue,
                        }
                    }
                },
            };

            let handler = Arc::new(DelegateHandler {
                delegate: shared.delegate.clone(),
            });
            let conn = Connection::spawn(ws, handler);
            *shared.conn.lock().expect("client conn lock") = Some(conn.clone());
            shared.connected_tx.send_replace(true);
            info!("connected to gateway at {}:{}", shared.config.host, shared.config.port);

            shared.delegate.on_start(&conn).await;

            let reconnect = tokio::select! {
                _ = conn.wait_closed() => true,
                _ = shutdown_rx.changed() => {
                    conn.stop().await;
                    false
                }
            };

            shared.connected_tx.send_replace(false);
            *shared.conn.lock().expect("client conn lock") = None;

            if !reconnect {
                break;
            }

            debug!("gateway connection closed; reconnecting in {:?}", retry);
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Stop the client for good: run the delegate's stop hook, close the
    /// live connection, and join the loop task. No reconnection follows.
    pub async fn stop(&self) {
        self.shared.delegate.on_stop().await;
        self.shared.shutdown_tx.send_replace(true);

        let conn = self.shared.conn.lock().expect("client conn lock").clone();
        if let Some(conn) = conn {
            conn.stop().await;
        }

        self.wait().await;
    }

    /// Join the background loop without stopping it.
    pub async fn wait(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// The live connection, if the loop currently has one.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.shared
            .conn
            .lock()
            .expect("client conn lock")
            .clone()
            .ok_or(GatewayError::NotConnected)
    }

    /// Whether a connection is currently established.
    pub fn connected(&self) -> bool {
        *self.shared.connected_tx.subscribe().borrow()
    }

    /// Wait until a connection is established.
    pub async fn wait_connected(&self) {
        let mut rx = self.shared.connected_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Issue a request on the live connection, raising on ERROR status.
    pub async fn request(&self, method: Method, data: Value) -> Result<Response> {
        self.connection()?.request(method, data).await
    }

    /// Issue a request on the live connection, returning the response as-is.
    pub async fn request_raw(&self, method: Method, data: Value) -> Result<Response> {
        self.connection()?.request_raw(method, data).await
    }

    /// Register an instance under a group.
    pub async fn register(&self, instance_name: &str, group_name: &str) -> Result<Response> {
        self.request(
            Method::Register,
            json!({"instance_name": instance_name, "group_name": group_name}),
        )
        .await
    }

    /// Deregister an instance by name.
    pub async fn deregister(&self, instance_name: &str) -> Result<Response> {
        self.request(Method::Deregister, json!(instance_name)).await
    }

    /// Query registered instances: all groups, or one group's members.
    pub async fn list(&self, group: Option<&str>) -> Result<Response> {
        self.request(Method::List, json!({"group": group})).await
    }

    /// Check whether an instance is available.
    pub async fn available(&self, instance_name: &str) -> Result<Response> {
        self.request(Method::Available, json!({"instance": instance_name}))
            .await
    }
}
