//! Liveness monitoring and keep-alive heart-beats.
//!
//! The monitor and the keep-alive writer are independent tasks: a slow
//! monitor tick never delays outgoing heart-beats and vice versa.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::connection::{Connection, close_code};
use super::registry::ConnectionRegistry;

/// Reason recorded when the monitor closes a connection.
pub const HEARTBEAT_FAILED: &str = "heartbeat failed";

/// Outcome of a heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No activity within twice the interval; the connection was closed.
    TimedOut,
    /// The connection closed for another reason.
    Cancelled,
}

/// Close `connection` once it has been idle for more than `2 × interval`.
///
/// Checks every `interval`. On timeout the connection is closed with
/// [`HEARTBEAT_FAILED`] and removed from `registry`; the loop then ends.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> HeartbeatResult {
    let cancel = connection.cancel_token();
    let deadline = interval * 2;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = connection.idle();
                if idle > deadline {
                    let conn_id = connection.id();
                    info!(%conn_id, idle_ms = idle.as_millis(), "no heart-beat, closing connection");
                    counter!("ws_heartbeat_timeouts_total").increment(1);
                    let _ = connection.close(close_code::HEARTBEAT_TIMEOUT, HEARTBEAT_FAILED);
                    let _ = registry.unregister(&conn_id);
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

/// Send a heart-beat EOL every `interval` until the connection closes.
///
/// Keep-alives are not activity: they never call [`Connection::touch`].
/// The monitor in [`run_heartbeat`] only counts traffic from the client,
/// meaning inbound frames, EOL heart-beats and transport Ping/Pong.
pub async fn run_keepalive(connection: Arc<Connection>, interval: Duration) {
    let cancel = connection.cancel_token();
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = connection.send_heartbeat() {
                    debug!(conn_id = %connection.id(), error = %e, "keep-alive not sent");
                    if connection.is_closed() {
                        return;
                    }
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}
