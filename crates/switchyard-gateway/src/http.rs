//! Stateless HTTP fallback for parties that cannot hold a socket open.
//!
//! `POST` on any path with body `{"method": <name>, "data": <payload>}`
//! dispatches through the same handler logic as the socket path. REGISTER and
//! DEREGISTER are refused here: they imply a connection identity to clean up
//! on disconnect, which a one-shot HTTP request does not have.
//!
//! Responses are `{"status": <0=ok>, "data": ...}` with the internal `id` and
//! `encoding` fields stripped; ERROR payloads are stringified so structured
//! error objects never leak as raw objects over HTTP.

use crate::gateway::GatewayShared;
use axum::body::to_bytes;
use axum::extract::{Request as HttpRequest, State};
use axum::http::{Method as HttpMethod, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_core::{GatewayError, Method, Request, Response, Result, Status};
use tracing::debug;

/// Cap on HTTP request bodies.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the fallback router; every path lands in the same handler.
pub(crate) fn router(shared: Arc<GatewayShared>) -> Router {
    Router::new()
        .fallback(handle_http_request)
        .with_state(shared)
}

async fn handle_http_request(
    State(shared): State<Arc<GatewayShared>>,
    request: HttpRequest,
) -> HttpResponse {
    if request.method() != HttpMethod::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let (parts, body) = request.into_parts();

    if !authorized(&shared.auth_key, &parts.headers, parts.uri.query()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": 1, "data": "Authentication required"})),
        )
            .into_response();
    }

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("failed to read HTTP body: {}", e);
            let err = GatewayError::InvalidMessage {
                message: "unreadable request body".to_string(),
            };
            return wire_response(err.to_response(0));
        }
    };

    let response = match dispatch(&shared, &bytes).await {
        Ok(response) => response,
        Err(e) => e.to_response(0),
    };

    wire_response(response)
}

/// Parse and dispatch one HTTP request body through the shared handler.
async fn dispatch(shared: &Arc<GatewayShared>, bytes: &[u8]) -> Result<Response> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| GatewayError::InvalidMessage {
            message: format!("unparsable request body: {}", e),
        })?;

    let method_name = value
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidMessage {
            message: "missing method field".to_string(),
        })?;
    let method = Method::from_name(method_name)?;

    if matches!(method, Method::Register | Method::Deregister) {
        return Err(GatewayError::InvalidMethod {
            name: method.name().to_string(),
        });
    }

    let data = value.get("data").cloned().unwrap_or(Value::Null);

    Ok(shared.handle_request(None, Request::new(method, data)).await)
}

/// Serialize an internal response for the HTTP surface: integer status,
/// `id`/`encoding` stripped, error payloads stringified.
fn wire_response(response: Response) -> HttpResponse {
    let data = match response.status {
        Status::Ok => response.data,
        _ => Value::String(stringify_error(&response.data)),
    };

    (
        StatusCode::OK,
        Json(json!({"status": response.status.code(), "data": data})),
    )
        .into_response()
}

/// Flatten a structured error payload to `"<Name>: <message>"`.
fn stringify_error(data: &Value) -> String {
    match (
        data.get("error").and_then(|v| v.as_str()),
        data.get("message").and_then(|v| v.as_str()),
    ) {
        (Some(error), Some(message)) => format!("{}: {}", error, message),
        _ => data.to_string(),
    }
}

/// Check the `Authentication: AuthKey <key>` header or the `auth_key` query
/// parameter.
fn authorized(auth_key: &str, headers: &axum::http::HeaderMap, query: Option<&str>) -> bool {
    let header_ok = headers
        .get("Authentication")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("AuthKey "))
        .map(|presented| presented == auth_key)
        .unwrap_or(false);
    if header_ok {
        return true;
    }

    query
        .map(|q| {
            q.split('&')
                .any(|part| part.strip_prefix("auth_key=") == Some(auth_key))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_authorized_by_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Authentication", "AuthKey secret".parse().unwrap());
        assert!(authorized("secret", &headers, None));

        headers.insert("Authentication", "AuthKey wrong".parse().unwrap());
        assert!(!authorized("secret", &headers, None));

        headers.insert("Authentication", "Bearer secret".parse().unwrap());
        assert!(!authorized("secret", &headers, None));
    }

    #[test]
    fn test_authorized_by_query() {
        let headers = HeaderMap::new();
        assert!(authorized("secret", &headers, Some("auth_key=secret")));
        assert!(authorized(
            "secret",
            &headers,
            Some("foo=1&auth_key=secret")
        ));
        assert!(!authorized("secret", &headers, Some("auth_key=wrong")));
        assert!(!authorized("secret", &headers, None));
    }

    #[test]
    fn test_stringify_error_payloads() {
        let structured = json!({"error": "GroupNotFoundError", "message": "group not found: g"});
        assert_eq!(
            stringify_error(&structured),
            "GroupNotFoundError: group not found: g"
        );

        let opaque = json!({"weird": true});
        assert_eq!(stringify_error(&opaque), r#"{"weird":true}"#);
    }
}
