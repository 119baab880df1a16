//! Connection multiplexer: one WebSocket, many concurrent callers.
//!
//! [`Connection`] turns a single duplex socket into a full-duplex
//! request/response channel. Outgoing requests get a fresh id and a
//! pending-response slot; the read loop routes matching responses to their
//! slot and hands unsolicited requests to the registered [`RequestHandler`].
//!
//! # Thread Safety
//!
//! Writes are serialized through a tokio `Mutex` so frames go out in the
//! order calls are issued. Any number of tasks may call `request()`
//! concurrently; each blocks only on its own id's slot. Inbound requests are
//! handled in their own spawned tasks so response routing is never stuck
//! behind a slow handler.

use crate::error::{GatewayError, Result};
use crate::protocol::{decode_frame, Frame, Method, Request, Response, Status};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Handler for requests initiated by the peer.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response for one inbound request.
    ///
    /// The returned response is sent back with the original request's id,
    /// whatever id the handler set.
    async fn handle_request(&self, request: Request) -> Response;
}

/// Type-erased write half so `Connection` itself is not generic over the
/// underlying stream (accepted sockets and client-side TLS streams differ).
type WsSink =
    Box<dyn Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin>;

/// Full-duplex request/response channel over one WebSocket.
pub struct Connection {
    writer: Mutex<WsSink>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    shutdown_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Connection {
    /// Take ownership of a WebSocket and start the read loop.
    ///
    /// The read loop runs as a background task until the peer closes, the
    /// transport fails, or [`Connection::stop`] is called; every exit path
    /// runs the same teardown exactly once.
    pub fn spawn<S>(ws: WebSocketStream<S>, handler: Arc<dyn RequestHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            writer: Mutex::new(Box::new(sink) as WsSink),
            pending: Mutex::new(HashMap::new()),
            shutdown_tx,
            closed_tx,
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(Self::read_loop(conn.clone(), stream, handler, shutdown_rx));

        conn
    }

    async fn read_loop<S>(
        conn: Arc<Connection>,
        mut stream: SplitStream<WebSocketStream<S>>,
        handler: Arc<dyn RequestHandler>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break,
                msg = stream.next() => msg,
            };

            match message {
                Some(Ok(Message::Text(text))) => conn.handle_frame(&text, &handler).await,
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by the protocol layer; binary frames are
                // not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("connection read error: {}", e);
                    break;
                }
            }
        }

        conn.teardown().await;
    }

    async fn handle_frame(self: &Arc<Self>, text: &str, handler: &Arc<dyn RequestHandler>) {
        match decode_frame(text) {
            Ok(Frame::Response(response)) => {
                let sender = self.pending.lock().await.remove(&response.id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    // A response for a request that already timed out or was
                    // torn down with its connection.
                    None => debug!(id = response.id, "dropping response with no pending slot"),
                }
            }
            Ok(Frame::Request(request)) => {
                let conn = Arc::clone(self);
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let id = request.id;
                    let mut response = handler.handle_request(request).await;
                    response.id = id;
                    if let Err(e) = conn.send_response(response).await {
                        debug!(id, "failed to send response: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("malformed frame: {}", e);
                // Best effort: if the frame still looks like a request with
                // an id, tell the sender what was wrong with it.
                if let Some(id) = request_id_of(text) {
                    if let Err(e) = self.send_response(e.to_response(id)).await {
                        debug!(id, "failed to send protocol error: {}", e);
                    }
                }
            }
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// The response is returned as-is, including relayed ERROR responses and
    /// the ERROR response injected when the connection closes while the
    /// request is in flight. `Err` is reserved for local encoding failures.
    pub async fn request_raw(&self, method: Method, data: Value) -> Result<Response> {
        let request = Request::new(method, data);
        let id = request.id;

        if self.stopped.load(Ordering::SeqCst) {
            return Ok(GatewayError::ServerConnectionLost.to_response(id));
        }

        let text = serde_json::to_string(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // Teardown drains the pending table after flagging the connection
        // stopped; re-check so a slot inserted after the drain is not
        // orphaned.
        if self.stopped.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Ok(GatewayError::ServerConnectionLost.to_response(id));
        }

        if let Err(e) = self.send_text(text).await {
            debug!(id, "request send failed: {}", e);
            self.pending.lock().await.remove(&id);
            return Ok(GatewayError::ServerConnectionLost.to_response(id));
        }

        match rx.await {
            Ok(response) => Ok(response),
            Err(_) => Ok(GatewayError::ServerConnectionLost.to_response(id)),
        }
    }

    /// Send a request and wait for the response, converting ERROR and
    /// NOT_FOUND statuses into errors.
    pub async fn request(&self, method: Method, data: Value) -> Result<Response> {
        let response = self.request_raw(method, data).await?;
        match response.status {
            Status::Ok => Ok(response),
            _ => Err(GatewayError::from_error_data(&response.data)),
        }
    }

    /// Send a response frame to the peer.
    pub async fn send_response(&self, response: Response) -> Result<()> {
        self.send_text(serde_json::to_string(&response)?).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Probe the transport with a ping frame.
    ///
    /// A send failure means the socket is dead (possibly half-open) and the
    /// connection should be stopped.
    pub async fn ping(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// Gracefully shut the connection down.
    ///
    /// Stops the read loop, fails every pending request with a
    /// connection-lost response, and closes the socket. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<(u64, oneshot::Sender<Response>)> =
            self.pending.lock().await.drain().collect();
        for (id, tx) in drained {
            let _ = tx.send(GatewayError::ServerConnectionLost.to_response(id));
        }

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }

        self.closed_tx.send_replace(true);
    }

    /// Whether teardown has run.
    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Watch channel that flips to `true` once the connection has closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Wait until the connection has closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Pull the id out of a frame that failed to decode, if it was a request.
fn request_id_of(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("method").is_none() {
        return None;
    }
    value.get("id")?.as_u64()
}
