//! Switchyard core - protocol, connection multiplexing, and client for the
//! switchyard message-routing gateway.
//!
//! Processes never talk to each other directly: servers register named
//! instances with the gateway, clients address those instances by name, and
//! the gateway forwards requests over the owning connection. This crate
//! provides the pieces both sides share:
//!
//! - [`protocol`] - the JSON wire envelopes ([`Request`], [`Response`]) and
//!   the closed [`Method`]/[`Status`] enumerations.
//! - [`connection`] - [`Connection`], which turns one WebSocket into a
//!   full-duplex request/response channel with id correlation.
//! - [`client`] - [`GatewayClient`], the reconnecting base used by both
//!   instance servers and calling clients.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_core::{ClientConfig, GatewayClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> switchyard_core::Result<()> {
//!     let config = ClientConfig::new("127.0.0.1", 8080, "secret");
//!     let client = GatewayClient::start(config, ());
//!     client.wait_connected().await;
//!
//!     let names = client.list(Some("search")).await?;
//!     println!("instances: {}", names.data);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use client::{ClientConfig, ClientDelegate, GatewayClient};
pub use connection::{Connection, RequestHandler};
pub use error::{GatewayError, Result};
pub use protocol::{decode_frame, next_message_id, Frame, Method, Request, Response, Status};
