//! The central broker: socket accept loop, request dispatch, and liveness.
//!
//! Every process connects here; nothing connects peer to peer. Each accepted
//! WebSocket becomes a [`Connection`] whose inbound requests land in
//! [`GatewayShared::handle_request`]. Registry mutations happen under one
//! synchronous mutex with no await inside, so validate-then-apply sequences
//! cannot interleave.

use crate::http;
use crate::registry::Registry;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_core::{Connection, GatewayError, Method, Request, RequestHandler, Response, Result, Status};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, error, info, warn};

/// Default interval between liveness sweeps over tracked connections.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Gateway listen and authentication parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    /// Socket (WebSocket) listen port. 0 for OS-assigned.
    pub port: u16,
    /// HTTP fallback listen port. 0 for OS-assigned.
    pub http_port: u16,
    pub auth_key: String,
    /// Interval between liveness sweeps.
    pub liveness_interval: Duration,
}

impl GatewayConfig {
    /// Create a config with the default liveness interval.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        http_port: u16,
        auth_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            http_port,
            auth_key: auth_key.into(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }
}

/// State shared by the socket path, the HTTP fallback, and the sweeper.
pub(crate) struct GatewayShared {
    pub(crate) auth_key: String,
    registry: Mutex<Registry>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_conn_id: AtomicU64,
}

impl GatewayShared {
    fn new(auth_key: String) -> Self {
        Self {
            auth_key,
            registry: Mutex::new(Registry::new()),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Handle one request and produce the response matched to its id.
    ///
    /// This is the single boundary where domain errors become ERROR
    /// responses; nothing below it panics or escapes.
    pub(crate) async fn handle_request(
        self: &Arc<Self>,
        conn_id: Option<u64>,
        request: Request,
    ) -> Response {
        let id = request.id;
        match self.dispatch(conn_id, request).await {
            Ok(mut response) => {
                response.id = id;
                response
            }
            Err(e) => e.to_response(id),
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        conn_id: Option<u64>,
        request: Request,
    ) -> Result<Response> {
        match request.method {
            Method::Register => {
                // Registration implies an identity to clean up on disconnect,
                // so it is only meaningful on a persistent connection.
                let conn_id = conn_id.ok_or_else(|| GatewayError::InvalidMethod {
                    name: Method::Register.name().to_string(),
                })?;
                let pairs = register_pairs(&request.data)?;
                self.registry
                    .lock()
                    .expect("registry lock")
                    .register(conn_id, &pairs)?;
                debug!(conn_id, count = pairs.len(), "registered instances");
                Ok(Response::ok(request.id, Value::Null))
            }

            Method::Deregister => {
                if conn_id.is_none() {
                    return Err(GatewayError::InvalidMethod {
                        name: Method::Deregister.name().to_string(),
                    });
                }
                let names = deregister_names(&request.data)?;
                self.registry
                    .lock()
                    .expect("registry lock")
                    .deregister(&names)?;
                debug!(count = names.len(), "deregistered instances");
                Ok(Response::ok(request.id, Value::Null))
            }

            Method::List => {
                let registry = self.registry.lock().expect("registry lock");
                match request.data.get("group") {
                    None | Some(Value::Null) => {
                        Ok(Response::ok(request.id, serde_json::to_value(registry.groups())?))
                    }
                    Some(Value::String(group)) => {
                        let members = registry.list_group(group)?;
                        let mut map = serde_json::Map::new();
                        map.insert(group.clone(), serde_json::to_value(members)?);
                        Ok(Response::ok(request.id, Value::Object(map)))
                    }
                    Some(_) => Err(GatewayError::InvalidMessage {
                        message: "group must be a string or null".to_string(),
                    }),
                }
            }

            // Server messages and AVAILABLE are forwarded opaquely to the
            // owning connection; status and payload pass through untouched.
            Method::Get
            | Method::Set
            | Method::Call
            | Method::Lock
            | Method::Unlock
            | Method::Metadata
            | Method::Available => {
                let name = instance_name(&request.data)?;
                let target = self
                    .connection_for(&name)
                    .ok_or_else(|| GatewayError::InstanceNotFound { name: name.clone() })?;

                let relayed = target.request_raw(request.method, request.data).await?;

                if relayed.status == Status::Ok {
                    if let Some(conn_id) = conn_id {
                        let mut registry = self.registry.lock().expect("registry lock");
                        match request.method {
                            Method::Lock => registry.record_lock(conn_id, &name),
                            Method::Unlock => registry.clear_lock(conn_id, &name),
                            _ => {}
                        }
                    }
                }

                Ok(relayed)
            }
        }
    }

    /// Live connection owning an instance name, if any.
    fn connection_for(&self, name: &str) -> Option<Arc<Connection>> {
        let conn_id = self.registry.lock().expect("registry lock").owner_of(name)?;
        self.connections
            .lock()
            .expect("connections lock")
            .get(&conn_id)
            .cloned()
    }
}

/// Bridges one socket connection's inbound requests into the dispatcher.
struct SocketHandler {
    shared: Arc<GatewayShared>,
    conn_id: u64,
}

#[async_trait]
impl RequestHandler for SocketHandler {
    async fn handle_request(&self, request: Request) -> Response {
        self.shared.handle_request(Some(self.conn_id), request).await
    }
}

/// The gateway broker.
pub struct Gateway;

impl Gateway {
    /// Bind both listeners and start the accept loop, the HTTP fallback, and
    /// the liveness sweeper.
    ///
    /// Returns a handle exposing the actual bound addresses (useful when the
    /// configured ports are 0).
    pub async fn start(config: GatewayConfig) -> Result<GatewayHandle> {
        let socket_listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let socket_addr = socket_listener.local_addr()?;

        let http_listener = TcpListener::bind((config.host.as_str(), config.http_port)).await?;
        let http_addr = http_listener.local_addr()?;

        let shared = Arc::new(GatewayShared::new(config.auth_key.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(Self::accept_loop(
            shared.clone(),
            socket_listener,
            shutdown_rx.clone(),
        ));

        let app = http::router(shared.clone());
        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!("HTTP server error: {}", e);
            }
        });

        let liveness_task = tokio::spawn(Self::liveness_loop(
            shared.clone(),
            config.liveness_interval,
            shutdown_rx,
        ));

        info!(
            "gateway listening on {} (socket) and {} (http)",
            socket_addr, http_addr
        );

        Ok(GatewayHandle {
            socket_addr,
            http_addr,
            shared,
            shutdown_tx,
            tasks: vec![accept_task, http_task, liveness_task],
        })
    }

    async fn accept_loop(
        shared: Arc<GatewayShared>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("gateway accept loop shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_socket(shared, stream, peer_addr).await {
                                    debug!("socket connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("socket accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Periodically probe every tracked connection. A failed ping means a
    /// dead (possibly half-open) socket whose close event never arrived;
    /// stopping the connection drives the normal cleanup path.
    async fn liveness_loop(
        shared: Arc<GatewayShared>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            Self::sweep(&shared).await;
        }
    }

    /// One liveness pass: ping every tracked connection and stop any whose
    /// transport refuses the probe.
    async fn sweep(shared: &Arc<GatewayShared>) {
        let conns: Vec<(u64, Arc<Connection>)> = shared
            .connections
            .lock()
            .expect("connections lock")
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect();

        for (conn_id, conn) in conns {
            if conn.ping().await.is_err() {
                warn!(conn_id, "connection failed liveness probe; closing");
                conn.stop().await;
            }
        }
    }
}

async fn handle_socket(
    shared: Arc<GatewayShared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let mut uri = None;
    let mut ws = accept_hdr_async(stream, |req: &HandshakeRequest, resp: HandshakeResponse| {
        uri = Some(req.uri().to_string());
        Ok(resp)
    })
    .await?;

    let presented = uri.as_deref().and_then(query_auth_key);
    if presented.as_deref() != Some(shared.auth_key.as_str()) {
        warn!("rejecting connection from {}: bad auth key", peer_addr);
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "invalid auth key".into(),
            }))
            .await;
        return Ok(());
    }

    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let handler = Arc::new(SocketHandler {
        shared: shared.clone(),
        conn_id,
    });
    let conn = Connection::spawn(ws, handler);
    shared
        .connections
        .lock()
        .expect("connections lock")
        .insert(conn_id, conn.clone());
    info!(conn_id, "connection established from {}", peer_addr);

    conn.wait_closed().await;
    cleanup_connection(&shared, conn_id).await;
    Ok(())
}

/// Remove a closed connection from every registry map and best-effort unlock
/// anything it still held.
async fn cleanup_connection(shared: &Arc<GatewayShared>, conn_id: u64) {
    shared
        .connections
        .lock()
        .expect("connections lock")
        .remove(&conn_id);

    let cleanup = shared
        .registry
        .lock()
        .expect("registry lock")
        .remove_connection(conn_id);

    if cleanup.instances.is_empty() {
        debug!(conn_id, "connection closed");
    } else {
        info!(
            conn_id,
            "connection closed; deregistered {} instance(s)",
            cleanup.instances.len()
        );
    }

    for name in cleanup.locked {
        if let Some(target) = shared.connection_for(&name) {
            // Errors swallowed: the owning connection may already be gone.
            let _ = target
                .request_raw(Method::Unlock, json!({"instance": name}))
                .await;
        }
    }
}

/// Extract the `auth_key` query value from a handshake URI.
///
/// Tolerates both `?` and `&` as the first separator
/// (`/socket&auth_key=k` is what some clients send).
fn query_auth_key(uri: &str) -> Option<String> {
    uri.split(['?', '&'])
        .skip(1)
        .find_map(|part| part.strip_prefix("auth_key="))
        .map(String::from)
}

/// Handle to a running gateway. Dropping shuts it down.
pub struct GatewayHandle {
    socket_addr: SocketAddr,
    http_addr: SocketAddr,
    shared: Arc<GatewayShared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    /// Actual socket listener address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Actual HTTP listener address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Shut the gateway down: stop accepting, close every tracked
    /// connection, and end the background tasks.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);

        let conns: Vec<Arc<Connection>> = self
            .shared
            .connections
            .lock()
            .expect("connections lock")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            conn.stop().await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Required `instance` field of a server-message payload.
fn instance_name(data: &Value) -> Result<String> {
    data.get("instance")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| GatewayError::InvalidMessage {
            message: "missing instance field".to_string(),
        })
}

/// REGISTER payload: one `{instance_name, group_name}` object or an array of
/// them.
fn register_pairs(data: &Value) -> Result<Vec<(String, String)>> {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        _ => {
            return Err(GatewayError::InvalidMessage {
                message: "REGISTER data must be an object or array of objects".to_string(),
            })
        }
    };

    items
        .into_iter()
        .map(|item| {
            let instance = item
                .get("instance_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::InvalidMessage {
                    message: "instance_name must not be null".to_string(),
                })?;
            let group = item
                .get("group_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::InvalidMessage {
                    message: "group_name must not be null".to_string(),
                })?;
            Ok((instance.to_string(), group.to_string()))
        })
        .collect()
}

/// DEREGISTER payload: one instance name or an array of names.
fn deregister_names(data: &Value) -> Result<Vec<String>> {
    match data {
        Value::String(name) => Ok(vec![name.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    GatewayError::InvalidMessage {
                        message: "DEREGISTER names must be strings".to_string(),
                    }
                })
            })
            .collect(),
        _ => Err(GatewayError::InvalidMessage {
            message: "DEREGISTER data must be a name or array of names".to_string(),
        }),
    }
}
