//! Server, heartbeat, protocol, logging and route settings.

use serde::{Deserialize, Serialize};

/// Network and WebSocket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Path prefix WebSocket clients connect on.
    pub ws_path: String,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Seconds to wait for tasks during graceful shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8984,
            ws_path: "/ws".to_string(),
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 1024,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Heart-beat settings, all in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Liveness interval used when CONNECT carries no `heart-beat` header.
    pub default_interval_ms: u64,
    /// Smallest interval at which the server sends keep-alives (`sx`).
    pub server_send_ms: u64,
    /// Interval at which the server wants client heart-beats (`sy`).
    pub server_receive_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            default_interval_ms: 10_000,
            server_send_ms: 10_000,
            server_receive_ms: 10_000,
        }
    }
}

/// STOMP protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StompSettings {
    /// Value of the `server` header in CONNECTED frames.
    pub server_name: String,
    /// Destination whose SEND frames are evaluated as queries.
    pub query_destination: String,
}

impl Default for StompSettings {
    fn default() -> Self {
        Self {
            server_name: concat!("xqws/", env!("CARGO_PKG_VERSION")).to_string(),
            query_destination: "/query".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A query function bound to every connection opened on `path`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSettings {
    /// Exact connection path, e.g. `/ws/chat`.
    pub path: String,
    /// Query text evaluated for each inbound message.
    pub query: String,
    /// Static base URI for the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 8984);
        assert_eq!(s.ws_path, "/ws");
        assert_eq!(s.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn heartbeat_defaults() {
        let h = HeartbeatSettings::default();
        assert_eq!(h.default_interval_ms, 10_000);
        assert_eq!(h.server_send_ms, 10_000);
        assert_eq!(h.server_receive_ms, 10_000);
    }

    #[test]
    fn server_name_carries_version() {
        assert!(StompSettings::default().server_name.starts_with("xqws/"));
    }

    #[test]
    fn route_base_uri_omitted_when_none() {
        let route = RouteSettings {
            path: "/ws/a".into(),
            query: "1".into(),
            base_uri: None,
        };
        let json = serde_json::to_value(&route).unwrap();
        assert!(json.get("baseUri").is_none());
    }
}
