//! Wire protocol for the switchyard gateway.
//!
//! Each frame is a single JSON object. Requests carry a `method`, responses a
//! `status`; both carry the correlation `id` and a method-specific `data`
//! payload:
//!
//! ```text
//! { "id": 7, "method": "CALL", "data": { "instance": "search-svc" } }
//! { "id": 7, "status": "OK", "data": { ... }, "encoding": "json" }
//! ```
//!
//! Ids come from a process-wide monotonically increasing counter and only
//! need to be unique among in-flight requests on one connection.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide message id counter.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh message id.
pub fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Request method kinds. Closed enumeration; decoding anything else is a
/// protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Set,
    Call,
    Lock,
    Unlock,
    Metadata,
    Available,
    Register,
    Deregister,
    List,
}

impl Method {
    /// Whether this method targets a specific instance and is opaquely
    /// forwarded to its owning connection.
    pub fn is_server_message(&self) -> bool {
        matches!(
            self,
            Method::Get
                | Method::Set
                | Method::Call
                | Method::Lock
                | Method::Unlock
                | Method::Metadata
        )
    }

    /// Parse a wire method name.
    pub fn from_name(name: &str) -> Result<Self> {
        serde_json::from_value(Value::String(name.to_string())).map_err(|_| {
            GatewayError::InvalidMethod {
                name: name.to_string(),
            }
        })
    }

    /// Wire name of this method.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Call => "CALL",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Metadata => "METADATA",
            Method::Available => "AVAILABLE",
            Method::Register => "REGISTER",
            Method::Deregister => "DEREGISTER",
            Method::List => "LIST",
        }
    }
}

/// Response status. Serialized as strings on the socket wire; the HTTP
/// fallback uses the integer from [`Status::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Error,
    NotFound,
}

impl Status {
    /// Integer status code used on the HTTP surface (0 = ok).
    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
            Status::NotFound => 2,
        }
    }
}

/// Request envelope. Created by a caller when initiating an operation and
/// consumed once by the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    /// Create a request with a fresh message id.
    pub fn new(method: Method, data: Value) -> Self {
        Self {
            id: next_message_id(),
            method,
            data,
        }
    }
}

/// Response envelope, matched to its request by `id` and consumed exactly
/// once by the party awaiting that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    #[serde(default)]
    pub data: Value,
    /// Wire-encoding tag; stripped before returning to HTTP callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Response {
    /// Create a response tagged with the default JSON encoding.
    pub fn new(id: u64, status: Status, data: Value) -> Self {
        Self {
            id,
            status,
            data,
            encoding: Some("json".to_string()),
        }
    }

    /// Create an OK response.
    pub fn ok(id: u64, data: Value) -> Self {
        Self::new(id, Status::Ok, data)
    }
}

/// A decoded inbound frame: either a request from the peer or a response to
/// one of ours.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Decode one wire frame.
///
/// The `method` key marks a request, the `status` key a response; anything
/// else (including unrecognized method or status values) is a
/// [`GatewayError::InvalidMessage`].
pub fn decode_frame(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text).map_err(|e| GatewayError::InvalidMessage {
        message: format!("unparsable frame: {}", e),
    })?;

    let object = value.as_object().ok_or_else(|| GatewayError::InvalidMessage {
        message: "frame is not a JSON object".to_string(),
    })?;

    if object.contains_key("method") {
        let request: Request =
            serde_json::from_value(value).map_err(|e| GatewayError::InvalidMessage {
                message: format!("malformed request: {}", e),
            })?;
        return Ok(Frame::Request(request));
    }

    if object.contains_key("status") {
        let response: Response =
            serde_json::from_value(value).map_err(|e| GatewayError::InvalidMessage {
                message: format!("malformed response: {}", e),
            })?;
        return Ok(Frame::Response(response));
    }

    Err(GatewayError::InvalidMessage {
        message: "frame has neither method nor status".to_string(),
    })
}
