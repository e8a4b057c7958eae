//! # xqws-core
//!
//! Shared vocabulary for the xqws crates:
//!
//! - **Branded IDs**: [`ConnectionId`] and [`JobId`] as newtypes so a job id is
//!   never passed where a connection id is expected
//! - **Logging**: `tracing` subscriber bootstrap and in-memory capture for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, JobId};
