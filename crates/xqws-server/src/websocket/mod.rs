//! Connection management, heartbeat, STOMP dispatch and query routing.

pub mod attributes;
pub mod bridge;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;

pub use attributes::AttributeStore;
pub use bridge::{Addressing, Job, QueryBridge};
pub use connection::{CloseReason, Connection, Outbound, close_code};
pub use handler::{HandleResult, ProtocolContext, ProtocolSession, SessionState};
pub use heartbeat::HeartbeatResult;
pub use registry::{ConnectionRegistry, DeliveryReport};
