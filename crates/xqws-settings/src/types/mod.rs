//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON files are accepted; missing fields keep their default.

mod server;

pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "heartbeat": { "defaultIntervalMs": 5000 },
///   "routes": [{ "path": "/ws/chat", "query": "declare variable $message external; $message" }]
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XqwsSettings {
    /// Network and WebSocket settings.
    pub server: ServerSettings,
    /// Liveness monitoring and keep-alive.
    pub heartbeat: HeartbeatSettings,
    /// STOMP protocol settings.
    pub stomp: StompSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Query functions bound to connection paths.
    pub routes: Vec<RouteSettings>,
}

impl XqwsSettings {
    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::SettingsError;

        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "wsPath must start with '/': {}",
                self.server.ws_path
            )));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be positive".into(),
            ));
        }
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(SettingsError::InvalidValue(format!(
                    "route path must start with '/': {}",
                    route.path
                )));
            }
            if route.query.trim().is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "route {} has an empty query",
                    route.path
                )));
            }
        }
        Ok(())
    }

    /// Route bound to a connection path, if any.
    pub fn route_for(&self, path: &str) -> Option<&RouteSettings> {
        self.routes.iter().find(|r| r.path == path)
    }
}
