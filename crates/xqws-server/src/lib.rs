//! # xqws-server
//!
//! Real-time messaging layer of the query server: STOMP over `WebSocket`.
//!
//! - [`websocket::Connection`]: one client session with its attribute store,
//!   subscriptions, liveness timestamp and optional bound query
//! - [`websocket::ConnectionRegistry`]: every live connection by id, with
//!   point-to-point, multicast and broadcast delivery
//! - [`websocket::heartbeat`]: deadline-based liveness monitor and keep-alives
//! - [`websocket::QueryBridge`]: asynchronous query evaluation routed back to
//!   connections through the registry
//! - [`server::XqwsServer`]: axum router, health endpoint, graceful shutdown

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod query;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{RegistryError, SendError};
pub use server::XqwsServer;
