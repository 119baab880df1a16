//! Switchyard gateway - the central broker every process connects to.
//!
//! Server processes register named instances over a persistent WebSocket;
//! client processes address those instances by name, either over their own
//! socket or through the stateless HTTP fallback. The gateway owns the
//! instance registry, forwards server messages to the owning connection, and
//! cleans up everything a connection registered the moment it drops.

pub mod gateway;
pub mod http;
pub mod registry;

// Re-export commonly used types
pub use gateway::{Gateway, GatewayConfig, GatewayHandle};
pub use registry::Registry;
