//! Server-side state for one client's `WebSocket` session.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xqws_core::ConnectionId;
use xqws_stomp::{Frame, header};

use super::attributes::AttributeStore;
use crate::errors::SendError;
use crate::query::{
    BoundFunction, OutputOptions, Payload, QueryValue, TextSerializer, ValueSerializer,
};

/// `destination` used when a delivery names none.
pub const DEFAULT_DESTINATION: &str = "/";

/// `WebSocket` close status codes used by the server.
pub mod close_code {
    /// Orderly close (DISCONNECT, session end).
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Handshake could not be completed.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No activity within twice the heart-beat interval.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
}

/// A write handed to the transport task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame (serialized STOMP frame or heart-beat EOL).
    Text(String),
    /// A raw binary frame.
    Binary(Bytes),
}

/// Status and reason recorded by [`Connection::close`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// `WebSocket` close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// One logical client.
///
/// Shared between the inbound frame handler, the heartbeat task and query
/// completions; every field is individually synchronized.
pub struct Connection {
    id: RwLock<ConnectionId>,
    path: String,
    remote_addr: Option<SocketAddr>,
    attributes: Arc<AttributeStore>,
    /// Subscription id to destination.
    subscriptions: Mutex<BTreeMap<String, String>>,
    bound: RwLock<Option<BoundFunction>>,
    tx: mpsc::Sender<Outbound>,
    serializer: Arc<dyn ValueSerializer>,
    last_activity: Mutex<Instant>,
    connected_at: Instant,
    message_seq: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection writing to `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: RwLock::new(id),
            path: DEFAULT_DESTINATION.to_owned(),
            remote_addr: None,
            attributes: Arc::new(AttributeStore::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            bound: RwLock::new(None),
            tx,
            serializer: Arc::new(TextSerializer),
            last_activity: Mutex::new(now),
            connected_at: now,
            message_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: URI path the client connected on.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Builder: peer address reported by the transport.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    /// Builder: serializer used by [`Connection::send`].
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Current id.
    pub fn id(&self) -> ConnectionId {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: ConnectionId) {
        *self.id.write() = id;
    }

    /// URI path the client connected on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Per-connection attribute store.
    pub fn attributes(&self) -> &Arc<AttributeStore> {
        &self.attributes
    }

    /// Bind a query function invoked for inbound messages.
    pub fn bind(&self, function: BoundFunction) {
        *self.bound.write() = Some(function);
    }

    /// The bound query function.
    pub fn bound_function(&self) -> Option<BoundFunction> {
        self.bound.read().clone()
    }

    /// Record a subscription. Returns `false` if `id` is already in use.
    pub fn subscribe(&self, id: impl Into<String>, destination: impl Into<String>) -> bool {
        let mut subs = self.subscriptions.lock();
        let id = id.into();
        if subs.contains_key(&id) {
            return false;
        }
        let _ = subs.insert(id, destination.into());
        true
    }

    /// Drop a subscription, returning its destination.
    pub fn unsubscribe(&self, id: &str) -> Option<String> {
        self.subscriptions.lock().remove(id)
    }

    /// First subscription id (in id order) listening on `destination`.
    pub fn subscription_for(&self, destination: &str) -> Option<String> {
        self.subscriptions
            .lock()
            .iter()
            .find(|(_, dest)| dest.as_str() == destination)
            .map(|(id, _)| id.clone())
    }

    /// All `(id, destination)` pairs.
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(id, dest)| (id.clone(), dest.clone()))
            .collect()
    }

    /// Serialize `value` and write it as a MESSAGE frame, or as a raw binary
    /// frame when the payload is binary.
    pub fn send(&self, value: &QueryValue, options: &OutputOptions) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.serializer.serialize(value, options)? {
            Payload::Binary(bytes) => self.enqueue(Outbound::Binary(bytes)),
            Payload::Text(body) => {
                let destination = options
                    .destination
                    .as_deref()
                    .unwrap_or(DEFAULT_DESTINATION);
                let subscription = self
                    .subscription_for(destination)
                    .unwrap_or_else(|| destination.to_owned());
                let mut frame =
                    Frame::message(destination, &self.next_message_id(), &subscription, body);
                if let Some(media_type) = &options.media_type {
                    frame = frame.with_header(header::CONTENT_TYPE, media_type);
                }
                for (key, value) in options.headers.iter() {
                    frame = frame.with_header(key, value);
                }
                self.send_frame(&frame)
            }
        }
    }

    /// Write a typed frame.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        self.enqueue(Outbound::Text(frame.serialize()))
    }

    /// Write a heart-beat EOL.
    pub fn send_heartbeat(&self) -> Result<(), SendError> {
        self.enqueue(Outbound::Text("\n".to_owned()))
    }

    fn enqueue(&self, message: Outbound) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn next_message_id(&self) -> String {
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.id())
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_activity.lock())
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Request a transport close. Returns `false` if already closed.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reason = reason.into();
        debug!(conn_id = %self.id(), code, reason = %reason, "closing connection");
        *self.close_reason.lock() = Some(CloseReason { code, reason });
        self.cancel.cancel();
        true
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Status recorded by the first [`Connection::close`] call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Token cancelled when the connection closes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("path", &self.path)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::OCTET_STREAM;
    use assert_matches::assert_matches;
    use xqws_stomp::Command;

    fn make_connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::new(ConnectionId::from("ws-1"), tx), rx)
    }

    fn recv_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => Frame::parse(&text).unwrap(),
            Outbound::Binary(_) => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn send_wraps_text_in_message_frame() {
        let (conn, mut rx) = make_connection(8);
        let options = OutputOptions::for_destination("/query").with_header("job-id", "j1");
        conn.send(&"result".into(), &options).unwrap();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.command(), Command::Message);
        assert_eq!(frame.header("destination"), Some("/query"));
        assert_eq!(frame.header("subscription"), Some("/query"));
        assert_eq!(frame.header("message-id"), Some("ws-1-0"));
        assert_eq!(frame.header("job-id"), Some("j1"));
        assert_eq!(frame.body(), "result");
    }

    #[tokio::test]
    async fn send_uses_subscription_id_for_destination() {
        let (conn, mut rx) = make_connection(8);
        assert!(conn.subscribe("sub-7", "/topic/a"));
        conn.send(&"x".into(), &OutputOptions::for_destination("/topic/a"))
            .unwrap();
        assert_eq!(recv_frame(&mut rx).header("subscription"), Some("sub-7"));
    }

    #[tokio::test]
    async fn message_ids_increase() {
        let (conn, mut rx) = make_connection(8);
        for _ in 0..3 {
            conn.send(&"x".into(), &OutputOptions::default()).unwrap();
        }
        let ids: Vec<String> = (0..3)
            .map(|_| recv_frame(&mut rx).header("message-id").unwrap().to_owned())
            .collect();
        assert_eq!(ids, ["ws-1-0", "ws-1-1", "ws-1-2"]);
    }

    #[tokio::test]
    async fn binary_payload_bypasses_frame() {
        let (conn, mut rx) = make_connection(8);
        let value = QueryValue::Binary(Bytes::from_static(b"\x00\xff"));
        conn.send(&value, &OutputOptions::default()).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Binary(Bytes::from_static(b"\x00\xff"))
        );

        let options = OutputOptions {
            media_type: Some(OCTET_STREAM.into()),
            ..OutputOptions::default()
        };
        conn.send(&"abc".into(), &options).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Binary(Bytes::from_static(b"abc"))
        );
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (conn, _rx) = make_connection(1);
        conn.send_heartbeat().unwrap();
        assert_matches!(conn.send_heartbeat(), Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn dropped_receiver_is_closed() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert_matches!(conn.send_heartbeat(), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _rx) = make_connection(4);
        let token = conn.cancel_token();
        assert!(conn.close(close_code::NORMAL, "bye"));
        assert!(!conn.close(close_code::GOING_AWAY, "again"));
        assert!(token.is_cancelled());
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason {
                code: close_code::NORMAL,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, mut rx) = make_connection(4);
        let _ = conn.close(close_code::NORMAL, "bye");
        assert_matches!(
            conn.send(&"x".into(), &OutputOptions::default()),
            Err(SendError::Closed)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle() {
        let (conn, _rx) = make_connection(4);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.idle(), Duration::from_secs(5));
        conn.touch();
        assert_eq!(conn.idle(), Duration::ZERO);
    }

    #[test]
    fn subscriptions() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.subscribe("1", "/q"));
        assert!(!conn.subscribe("1", "/other"));
        assert!(conn.subscribe("2", "/q"));
        assert_eq!(conn.subscription_for("/q").as_deref(), Some("1"));
        assert_eq!(conn.unsubscribe("1").as_deref(), Some("/q"));
        assert!(conn.unsubscribe("1").is_none());
        assert_eq!(
            conn.subscriptions(),
            vec![("2".to_string(), "/q".to_string())]
        );
    }

    #[test]
    fn bind_function() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.bound_function().is_none());
        conn.bind(BoundFunction {
            query: "$message".into(),
            base_uri: None,
        });
        assert_eq!(conn.bound_function().unwrap().query, "$message");
    }

    #[test]
    fn builders() {
        let (tx, _rx) = mpsc::channel(1);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let conn = Connection::new(ConnectionId::from("ws-2"), tx)
            .with_path("/ws/chat")
            .with_remote_addr(Some(addr));
        assert_eq!(conn.path(), "/ws/chat");
        assert_eq!(conn.remote_addr(), Some(addr));
        conn.set_id(ConnectionId::from("alice"));
        assert_eq!(conn.id().as_str(), "alice");
    }
}
