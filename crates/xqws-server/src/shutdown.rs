//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::{ConnectionRegistry, QueryBridge, close_code};

/// Default time allowed for tasks to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Close reason sent to every client on shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Coordinates graceful shutdown across all server tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut everything down.
    ///
    /// 1. Cancel the token (stops accepting connections)
    /// 2. Close every registered connection with 1001
    /// 3. Abort running query jobs
    /// 4. Wait up to `timeout` for `handles`, then abort the stragglers
    pub async fn graceful_shutdown(
        &self,
        registry: &ConnectionRegistry,
        bridge: &QueryBridge,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let closed = registry.close_all(close_code::GOING_AWAY, SHUTDOWN_REASON);
        let aborted = bridge.abort_all();
        info!(
            closed,
            aborted,
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
