//! `WebSocket` session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{Connection, Outbound, close_code};
use super::handler::{HandleResult, ProtocolContext, ProtocolSession};
use super::heartbeat::{run_heartbeat, run_keepalive};

/// How long queued frames may take to flush after the connection closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a `WebSocket` session for a connected client.
///
/// 1. Registers the connection
/// 2. Forwards queued outbound frames to the socket
/// 3. Feeds inbound text to the STOMP state machine, in arrival order
/// 4. Starts the liveness monitor and keep-alives once the handshake completes
/// 5. Closes, unregisters and flushes on disconnect
#[instrument(skip_all, fields(conn_id = %connection.id()))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection: Arc<Connection>,
    rx: mpsc::Receiver<Outbound>,
    ctx: Arc<ProtocolContext>,
) {
    if let Err(e) = ctx.registry.register(connection.clone()) {
        warn!(error = %e, "refusing connection");
        return;
    }

    let started = Instant::now();
    info!(remote = ?connection.remote_addr(), path = connection.path(), "client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let (ws_tx, mut ws_rx) = ws.split();
    let outbound = tokio::spawn(forward_outbound(ws_tx, rx, connection.clone()));
    let outbound_abort = outbound.abort_handle();

    let cancel = connection.cancel_token();
    let mut protocol = ProtocolSession::new(connection.clone(), ctx.clone());

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let outcome = match msg {
            Some(Ok(Message::Text(text))) => protocol.handle_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => {
                if let Ok(text) = std::str::from_utf8(&data) {
                    protocol.handle_text(text)
                } else {
                    connection.touch();
                    debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                connection.touch();
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                info!("client sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break;
            }
            None => break,
        };

        match outcome {
            HandleResult::Continue => {}
            HandleResult::Connected(heart_beat) => {
                if let Some(interval) = heart_beat.incoming {
                    let _ = tokio::spawn(run_heartbeat(
                        connection.clone(),
                        ctx.registry.clone(),
                        interval,
                    ));
                }
                if let Some(interval) = heart_beat.outgoing {
                    let _ = tokio::spawn(run_keepalive(connection.clone(), interval));
                }
                debug!(?heart_beat, "heart-beating started");
            }
            HandleResult::Close => break,
        }
    }

    let _ = connection.close(close_code::NORMAL, "session ended");
    let _ = ctx.registry.unregister(&connection.id());
    if tokio::time::timeout(DRAIN_TIMEOUT, outbound).await.is_err() {
        debug!("outbound writer did not drain in time");
        outbound_abort.abort();
    }

    info!("client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
}

/// Write queued frames to the socket until the connection closes, then flush
/// what is left and send the close frame.
async fn forward_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
) {
    let cancel = connection.cancel_token();
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(out) => {
                    if ws_tx.send(to_message(out)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }

    while let Ok(out) = rx.try_recv() {
        if ws_tx.send(to_message(out)).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(close_frame(&connection))).await;
    let _ = ws_tx.close().await;
}

fn to_message(out: Outbound) -> Message {
    match out {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Binary(bytes) => Message::Binary(bytes),
    }
}

fn close_frame(connection: &Connection) -> Option<CloseFrame> {
    connection.close_reason().map(|r| CloseFrame {
        code: r.code,
        reason: r.reason.into(),
    })
}
