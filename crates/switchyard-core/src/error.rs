//! Error types for the switchyard gateway and its clients.
//!
//! Domain errors are never allowed to escape a request handler as a crash;
//! they are converted into ERROR-status responses at a single boundary point
//! (`to_response`) and reconstructed on the far side (`from_error_data`).

use crate::protocol::{Response, Status};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for switchyard operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // Registry errors
    #[error("instance not found: {name}")]
    InstanceNotFound { name: String },

    #[error("group not found: {name}")]
    GroupNotFound { name: String },

    #[error("instance already registered: {name} in group {group}")]
    InstanceAlreadyRegistered { group: String, name: String },

    // Protocol errors
    #[error("invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("invalid method: {name}")]
    InvalidMethod { name: String },

    // Connection errors
    #[error("server connection lost")]
    ServerConnectionLost,

    #[error("not connected to gateway")]
    NotConnected,

    /// An ERROR response relayed back from the remote side.
    #[error("{error}: {message}")]
    Remote { error: String, message: String },

    // Transport errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for switchyard operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable wire name for this error kind.
    ///
    /// These names are what clients match on; they must not change between
    /// releases.
    pub fn error_name(&self) -> &str {
        match self {
            GatewayError::InstanceNotFound { .. } => "InstanceNotFoundError",
            GatewayError::GroupNotFound { .. } => "GroupNotFoundError",
            GatewayError::InstanceAlreadyRegistered { .. } => "InstanceAlreadyRegisteredError",
            GatewayError::InvalidMessage { .. } => "InvalidMessageError",
            GatewayError::InvalidMethod { .. } => "InvalidMethodError",
            GatewayError::ServerConnectionLost => "ServerConnectionLostError",
            GatewayError::NotConnected => "NotConnectedError",
            GatewayError::Remote { error, .. } => error,
            GatewayError::Io(_) => "IoError",
            GatewayError::Json(_) => "JsonError",
            GatewayError::WebSocket(_) => "WebSocketError",
        }
    }

    /// Wire status carried by a response for this error.
    pub fn status(&self) -> Status {
        match self {
            GatewayError::InstanceNotFound { .. } => Status::NotFound,
            _ => Status::Error,
        }
    }

    /// Structured error payload placed in a response `data` field.
    pub fn to_error_data(&self) -> Value {
        json!({
            "error": self.error_name(),
            "message": self.to_string(),
        })
    }

    /// Convert this error into a response matched to the originating request id.
    pub fn to_response(&self, id: u64) -> Response {
        Response::new(id, self.status(), self.to_error_data())
    }

    /// Reconstruct an error from a relayed ERROR payload.
    ///
    /// Connection-lost responses become [`GatewayError::ServerConnectionLost`]
    /// so callers can distinguish transport failure from domain errors;
    /// everything else surfaces as [`GatewayError::Remote`].
    pub fn from_error_data(data: &Value) -> Self {
        let error = data
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("UnknownError")
            .to_string();
        let message = data
            .get("message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| data.to_string());

        if error == "ServerConnectionLostError" {
            return GatewayError::ServerConnectionLost;
        }

        GatewayError::Remote { error, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::InstanceNotFound {
            name: "search-svc".into(),
        };
        assert_eq!(err.to_string(), "instance not found: search-svc");
    }

    #[test]
    fn test_error_names_are_stable() {
        assert_eq!(
            GatewayError::InstanceAlreadyRegistered {
                group: "search".into(),
                name: "search-svc".into(),
            }
            .error_name(),
            "InstanceAlreadyRegisteredError"
        );
        assert_eq!(
            GatewayError::ServerConnectionLost.error_name(),
            "ServerConnectionLostError"
        );
    }

    #[test]
    fn test_instance_not_found_maps_to_not_found_status() {
        let err = GatewayError::InstanceNotFound { name: "x".into() };
        assert_eq!(err.status(), Status::NotFound);
        assert_eq!(
            GatewayError::InvalidMessage {
                message: "bad".into()
            }
            .status(),
            Status::Error
        );
    }

    #[test]
    fn test_error_data_roundtrip() {
        let err = GatewayError::GroupNotFound { name: "g".into() };
        let data = err.to_error_data();
        match GatewayError::from_error_data(&data) {
            GatewayError::Remote { error, message } => {
                assert_eq!(error, "GroupNotFoundError");
                assert!(message.contains("g"));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_connection_lost_roundtrip() {
        let data = GatewayError::ServerConnectionLost.to_error_data();
        assert!(matches!(
            GatewayError::from_error_data(&data),
            GatewayError::ServerConnectionLost
        ));
    }
}
