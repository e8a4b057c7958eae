//! Per-connection STOMP protocol state machine.
//!
//! `AwaitingConnect → Connected → Disconnected`. Frames are handled in
//! arrival order on the connection's own task; anything slow (query
//! evaluation) is handed to the [`QueryBridge`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use xqws_core::{ConnectionId, JobId};
use xqws_settings::XqwsSettings;
use xqws_stomp::error::{HEADER_ERROR, PROTOCOL_ERROR};
use xqws_stomp::{
    Command, Frame, FrameError, HeartBeat, NegotiatedHeartBeat, SUPPORTED_VERSIONS, header,
    is_heartbeat, negotiate_version,
};

use super::bridge::{Addressing, JOB_ID, QueryBridge};
use super::connection::{Connection, close_code};
use super::registry::ConnectionRegistry;
use crate::errors::RegistryError;
use crate::query::{Bindings, OutputOptions, QueryRequest, QueryValue};

/// Prefix of SEND headers that bind external query variables.
pub const BIND_PREFIX: &str = "bind-";
/// SEND header carrying the query's static base URI.
pub const BASE_URI: &str = "base-uri";
/// SEND header selecting result addressing: `self`, `broadcast`, `multicast`.
pub const TARGET: &str = "target";
/// SEND header naming the id a broadcast leaves out.
pub const EXCLUDE: &str = "exclude";
/// SEND header listing multicast recipients, comma separated.
pub const IDS: &str = "ids";
/// ERROR `message` for a custom id that is already taken.
pub const DUPLICATE_ID: &str = "DUPLICATE_ID";

/// Shared collaborators every session needs.
pub struct ProtocolContext {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Query dispatch.
    pub bridge: Arc<QueryBridge>,
    /// Server settings.
    pub settings: Arc<XqwsSettings>,
}

/// Handshake state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Only CONNECT/STOMP is accepted.
    AwaitingConnect,
    /// Handshake complete.
    Connected,
    /// DISCONNECT processed or handshake refused.
    Disconnected,
}

/// What the transport loop should do after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleResult {
    /// Keep reading.
    Continue,
    /// Handshake completed; start heart-beating as negotiated.
    Connected(NegotiatedHeartBeat),
    /// Close the connection.
    Close,
}

/// A refused client frame, answered with an ERROR frame.
struct Rejection {
    code: &'static str,
    message: String,
}

impl Rejection {
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: PROTOCOL_ERROR,
            message: message.into(),
        }
    }
}

impl From<FrameError> for Rejection {
    fn from(err: FrameError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Protocol handler for one connection.
pub struct ProtocolSession {
    connection: Arc<Connection>,
    ctx: Arc<ProtocolContext>,
    state: SessionState,
}

impl ProtocolSession {
    /// Start in [`SessionState::AwaitingConnect`].
    pub fn new(connection: Arc<Connection>, ctx: Arc<ProtocolContext>) -> Self {
        Self {
            connection,
            ctx,
            state: SessionState::AwaitingConnect,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one inbound text message.
    ///
    /// Every message counts as activity. Malformed frames are answered with
    /// an ERROR frame and the connection stays open.
    pub fn handle_text(&mut self, raw: &str) -> HandleResult {
        self.connection.touch();
        if self.state == SessionState::Disconnected {
            return HandleResult::Close;
        }
        if is_heartbeat(raw) {
            trace!(conn_id = %self.connection.id(), "heart-beat received");
            return HandleResult::Continue;
        }
        match Frame::parse(raw) {
            Ok(frame) => self.handle_frame(&frame),
            Err(e) => {
                debug!(conn_id = %self.connection.id(), error = %e, "rejected malformed frame");
                self.reject(e.into());
                HandleResult::Continue
            }
        }
    }

    /// Handle one parsed frame.
    pub fn handle_frame(&mut self, frame: &Frame) -> HandleResult {
        let command = frame.command();
        if let Err(e) = frame.validate() {
            self.reject(e.into());
            return HandleResult::Continue;
        }
        if !command.is_client_command() {
            self.reject(Rejection::protocol(format!(
                "{command} is not a client command"
            )));
            return HandleResult::Continue;
        }
        if command.is_connect() {
            return self.handle_connect(frame);
        }
        if self.state != SessionState::Connected {
            self.reject(Rejection::protocol(format!(
                "{command} received before CONNECT"
            )));
            return HandleResult::Continue;
        }

        let outcome = match command {
            Command::Send => self.handle_send(frame),
            Command::Subscribe => self.handle_subscribe(frame),
            Command::Unsubscribe => {
                self.handle_unsubscribe(frame);
                Ok(None)
            }
            Command::Disconnect => {
                info!(conn_id = %self.connection.id(), "client disconnected");
                self.state = SessionState::Disconnected;
                self.acknowledge(frame, None);
                return HandleResult::Close;
            }
            _ => {
                trace!(%command, "accepted, not applied");
                Ok(None)
            }
        };

        match outcome {
            Ok(job) => self.acknowledge(frame, job.as_ref()),
            Err(rejection) => self.reject(rejection),
        }
        HandleResult::Continue
    }

    fn handle_connect(&mut self, frame: &Frame) -> HandleResult {
        if self.state == SessionState::Connected {
            self.reject(Rejection::protocol("already connected"));
            return HandleResult::Continue;
        }

        let accept = frame.header(header::ACCEPT_VERSION).unwrap_or_default();
        let Some(version) = negotiate_version(accept) else {
            warn!(conn_id = %self.connection.id(), accept, "no common protocol version");
            self.reject(Rejection::protocol(format!(
                "unsupported protocol version '{accept}', supported versions are {}",
                SUPPORTED_VERSIONS.join(",")
            )));
            let _ = self
                .connection
                .close(close_code::PROTOCOL_ERROR, "unsupported protocol version");
            self.state = SessionState::Disconnected;
            return HandleResult::Close;
        };

        let hb = &self.ctx.settings.heartbeat;
        let server = HeartBeat::new(hb.server_send_ms, hb.server_receive_ms);
        let negotiated = match frame.header(header::HEART_BEAT) {
            Some(value) => match value.parse::<HeartBeat>() {
                Ok(client) => NegotiatedHeartBeat::negotiate(client, server),
                Err(e) => {
                    self.reject(e.into());
                    return HandleResult::Continue;
                }
            },
            None => NegotiatedHeartBeat {
                incoming: (hb.default_interval_ms > 0)
                    .then(|| Duration::from_millis(hb.default_interval_ms)),
                outgoing: None,
            },
        };

        if let Some(custom) = frame.header(header::ID) {
            if custom.is_empty() {
                self.reject(Rejection::protocol("connection id must not be empty"));
                return HandleResult::Continue;
            }
            let current = self.connection.id();
            if let Err(e) = self
                .ctx
                .registry
                .rekey(&current, ConnectionId::from(custom))
            {
                let code = match e {
                    RegistryError::DuplicateId(_) => DUPLICATE_ID,
                    _ => PROTOCOL_ERROR,
                };
                self.reject(Rejection {
                    code,
                    message: e.to_string(),
                });
                return HandleResult::Continue;
            }
        }

        let session = self.connection.id();
        self.reply(&Frame::connected(
            version,
            server,
            &self.ctx.settings.stomp.server_name,
            session.as_str(),
        ));
        self.state = SessionState::Connected;
        info!(conn_id = %session, version, "STOMP session established");
        HandleResult::Connected(negotiated)
    }

    fn handle_send(&self, frame: &Frame) -> Result<Option<JobId>, Rejection> {
        let destination = frame.header(header::DESTINATION).unwrap_or_default();
        if destination == self.ctx.settings.stomp.query_destination {
            return self.dispatch_query(frame, destination).map(Some);
        }

        let origin = self.connection.id();
        if let Some(function) = self.connection.bound_function() {
            let request = QueryRequest {
                query: function.query,
                bindings: Bindings::new(),
                base_uri: function.base_uri,
                ..QueryRequest::default()
            }
            .bind("message", frame.body())
            .bind("destination", destination)
            .bind("id", origin.as_str());
            let job = self.ctx.bridge.submit(
                request,
                origin,
                Addressing::Origin,
                OutputOptions::for_destination(destination),
            );
            return Ok(Some(job));
        }

        let options = OutputOptions {
            media_type: frame.header(header::CONTENT_TYPE).map(str::to_owned),
            ..OutputOptions::default()
        };
        let report = self.ctx.registry.publish(
            destination,
            &QueryValue::Text(frame.body().to_owned()),
            &options,
        );
        debug!(
            conn_id = %origin,
            destination,
            recipients = report.delivered_count(),
            "message published"
        );
        Ok(None)
    }

    fn dispatch_query(&self, frame: &Frame, destination: &str) -> Result<JobId, Rejection> {
        let bindings: Bindings = frame
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(BIND_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_owned(), value.to_owned()))
            })
            .collect();

        let addressing = match frame.header(TARGET).unwrap_or("self") {
            "self" => Addressing::Origin,
            "broadcast" => Addressing::Broadcast {
                exclude: frame
                    .header(EXCLUDE)
                    .filter(|id| !id.is_empty())
                    .map(ConnectionId::from),
            },
            "multicast" => {
                let ids = frame.header(IDS).ok_or_else(|| Rejection {
                    code: HEADER_ERROR,
                    message: format!("multicast target requires header '{IDS}'"),
                })?;
                Addressing::Connections(
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(ConnectionId::from)
                        .collect(),
                )
            }
            other => return Err(Rejection::protocol(format!("unknown target '{other}'"))),
        };

        let request = QueryRequest {
            query: frame.body().to_owned(),
            bindings,
            base_uri: frame.header(BASE_URI).map(str::to_owned),
            ..QueryRequest::default()
        };
        Ok(self.ctx.bridge.submit(
            request,
            self.connection.id(),
            addressing,
            OutputOptions::for_destination(destination),
        ))
    }

    fn handle_subscribe(&self, frame: &Frame) -> Result<Option<JobId>, Rejection> {
        let id = frame.header(header::ID).unwrap_or_default();
        let destination = frame.header(header::DESTINATION).unwrap_or_default();
        if !self.connection.subscribe(id, destination) {
            return Err(Rejection::protocol(format!(
                "subscription id '{id}' already in use"
            )));
        }
        debug!(conn_id = %self.connection.id(), sub_id = id, destination, "subscribed");
        Ok(None)
    }

    fn handle_unsubscribe(&self, frame: &Frame) {
        let id = frame.header(header::ID).unwrap_or_default();
        match self.connection.unsubscribe(id) {
            Some(destination) => {
                debug!(conn_id = %self.connection.id(), sub_id = id, destination = %destination, "unsubscribed");
            }
            None => debug!(conn_id = %self.connection.id(), sub_id = id, "unknown subscription"),
        }
    }

    fn acknowledge(&self, frame: &Frame, job: Option<&JobId>) {
        if let Some(mut receipt) = frame.receipt() {
            if let Some(job) = job {
                receipt = receipt.with_header(JOB_ID, job.as_str());
            }
            self.reply(&receipt);
        }
    }

    fn reject(&self, rejection: Rejection) {
        debug!(
            conn_id = %self.connection.id(),
            code = rejection.code,
            message = %rejection.message,
            "frame rejected"
        );
        self.reply(&Frame::error(rejection.code, rejection.message));
    }

    fn reply(&self, frame: &Frame) {
        if let Err(e) = self.connection.send_frame(frame) {
            debug!(conn_id = %self.connection.id(), error = %e, "reply not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EvaluationError, QueryEvaluator, QueryValue};
    use crate::websocket::connection::Outbound;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl QueryEvaluator for Echo {
        async fn evaluate(&self, request: QueryRequest) -> Result<QueryValue, EvaluationError> {
            let mut out = request.query;
            for (name, value) in &request.bindings {
                out = out.replace(&format!("${name}"), value);
            }
            Ok(QueryValue::Text(out))
        }
    }

    struct Harness {
        session: ProtocolSession,
        connection: Arc<Connection>,
        ctx: Arc<ProtocolContext>,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(XqwsSettings::default())
        }

        fn with_settings(settings: XqwsSettings) -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let bridge = Arc::new(QueryBridge::new(Arc::new(Echo), registry.clone()));
            let ctx = Arc::new(ProtocolContext {
                registry: registry.clone(),
                bridge,
                settings: Arc::new(settings),
            });
            let (tx, rx) = mpsc::channel(32);
            let connection = Arc::new(Connection::new(registry.next_id(), tx));
            let _ = registry.register(connection.clone()).unwrap();
            Self {
                session: ProtocolSession::new(connection.clone(), ctx.clone()),
                connection,
                ctx,
                rx,
            }
        }

        fn send(&mut self, raw: &str) -> HandleResult {
            self.session.handle_text(raw)
        }

        fn connect(&mut self) {
            let result = self.send("CONNECT\naccept-version:1.2\n\n\0");
            assert!(matches!(result, HandleResult::Connected(_)));
            assert_eq!(self.next().command(), Command::Connected);
        }

        fn next(&mut self) -> Frame {
            match self.rx.try_recv().unwrap() {
                Outbound::Text(text) => Frame::parse(&text).unwrap(),
                Outbound::Binary(_) => panic!("expected text"),
            }
        }

        async fn next_async(&mut self) -> Frame {
            match self.rx.recv().await.unwrap() {
                Outbound::Text(text) => Frame::parse(&text).unwrap(),
                Outbound::Binary(_) => panic!("expected text"),
            }
        }
    }

    #[tokio::test]
    async fn connect_negotiates_version_and_heartbeat() {
        let mut h = Harness::new();
        let result = h.send("CONNECT\naccept-version:1.0,1.1,1.2\nheart-beat:5000,20000\n\n\0");
        assert_eq!(
            result,
            HandleResult::Connected(NegotiatedHeartBeat {
                incoming: Some(Duration::from_millis(10_000)),
                outgoing: Some(Duration::from_millis(20_000)),
            })
        );
        let frame = h.next();
        assert_eq!(frame.command(), Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
        assert_eq!(frame.header("heart-beat"), Some("10000,10000"));
        assert_eq!(frame.header("session"), Some(h.connection.id().as_str()));
        assert!(frame.header("server").unwrap().starts_with("xqws/"));
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn connect_without_heartbeat_uses_default_interval() {
        let mut h = Harness::new();
        let result = h.send("STOMP\naccept-version:1.1\nhost:x\n\n\0");
        assert_eq!(
            result,
            HandleResult::Connected(NegotiatedHeartBeat {
                incoming: Some(Duration::from_millis(10_000)),
                outgoing: None,
            })
        );
        assert_eq!(h.next().header("version"), Some("1.1"));
    }

    #[tokio::test]
    async fn zero_heartbeat_disables_monitoring() {
        let mut h = Harness::new();
        let result = h.send("CONNECT\naccept-version:1.2\nheart-beat:0,0\n\n\0");
        assert_eq!(
            result,
            HandleResult::Connected(NegotiatedHeartBeat::default())
        );
    }

    #[tokio::test]
    async fn unsupported_version_closes() {
        let mut h = Harness::new();
        assert_eq!(h.send("CONNECT\naccept-version:2.0\n\n\0"), HandleResult::Close);
        let frame = h.next();
        assert_eq!(frame.command(), Command::Error);
        assert!(frame.body().contains("1.0,1.1,1.2"));
        assert_eq!(
            h.connection.close_reason().unwrap().code,
            close_code::PROTOCOL_ERROR
        );
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let mut h = Harness::new();
        assert_eq!(h.send("SEND\ndestination:/a\n\nx\0"), HandleResult::Continue);
        let frame = h.next();
        assert_eq!(frame.command(), Command::Error);
        assert_eq!(frame.header("message"), Some(PROTOCOL_ERROR));
        assert!(frame.body().contains("before CONNECT"));
        assert_eq!(h.session.state(), SessionState::AwaitingConnect);
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let mut h = Harness::new();
        h.connect();
        assert_eq!(h.send("CONNECT\naccept-version:1.2\n\n\0"), HandleResult::Continue);
        assert!(h.next().body().contains("already connected"));
    }

    #[tokio::test]
    async fn server_commands_are_rejected() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("RECEIPT\nreceipt-id:1\n\n\0");
        assert!(h.next().body().contains("not a client command"));
    }

    #[tokio::test]
    async fn bad_unsubscribe_keeps_subscription() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SUBSCRIBE\ndestination:/q\nid:1\n\n\0");
        let _ = h.send("UNSUBSCRIBE\n\n\0");

        let frame = h.next();
        assert_eq!(frame.command(), Command::Error);
        assert_eq!(frame.header("message"), Some(HEADER_ERROR));
        assert_eq!(
            h.connection.subscriptions(),
            vec![("1".to_string(), "/q".to_string())]
        );
        assert_eq!(h.ctx.registry.subscribers("/q").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SUBSCRIBE\ndestination:/a\nid:1\n\n\0");
        let _ = h.send("SUBSCRIBE\ndestination:/b\nid:1\nreceipt:r1\n\n\0");
        let frame = h.next();
        assert_eq!(frame.command(), Command::Error);
        assert!(frame.body().contains("already in use"));
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_noop() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("UNSUBSCRIBE\nid:nope\nreceipt:r2\n\n\0");
        let frame = h.next();
        assert_eq!(frame.command(), Command::Receipt);
        assert_eq!(frame.header("receipt-id"), Some("r2"));
    }

    #[tokio::test]
    async fn send_fans_out_to_subscribers() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SUBSCRIBE\ndestination:/chat\nid:sub-0\n\n\0");
        let _ = h.send("SEND\ndestination:/chat\n\nhi all\0");
        let frame = h.next();
        assert_eq!(frame.command(), Command::Message);
        assert_eq!(frame.header("subscription"), Some("sub-0"));
        assert_eq!(frame.body(), "hi all");
    }

    #[tokio::test]
    async fn query_send_replies_with_job_id() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SEND\ndestination:/query\nbind-name:Ada\nreceipt:q1\n\nhello $name\0");

        let receipt = h.next();
        assert_eq!(receipt.command(), Command::Receipt);
        assert_eq!(receipt.header("receipt-id"), Some("q1"));
        let job_id = receipt.header(JOB_ID).unwrap().to_owned();

        let message = h.next_async().await;
        assert_eq!(message.command(), Command::Message);
        assert_eq!(message.body(), "hello Ada");
        assert_eq!(message.header(JOB_ID), Some(job_id.as_str()));
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SEND\ndestination:/query\ntarget:everyone\n\n1\0");
        assert!(h.next().body().contains("unknown target"));
    }

    #[tokio::test]
    async fn multicast_requires_ids() {
        let mut h = Harness::new();
        h.connect();
        let _ = h.send("SEND\ndestination:/query\ntarget:multicast\n\n1\0");
        assert_eq!(h.next().header("message"), Some(HEADER_ERROR));
    }

    #[tokio::test]
    async fn bound_function_receives_message() {
        let mut h = Harness::new();
        h.connection.bind(crate::query::BoundFunction {
            query: "[$id] $destination: $message".into(),
            base_uri: None,
        });
        h.connect();
        let _ = h.send("SEND\ndestination:/room\n\nping\0");
        let frame = h.next_async().await;
        assert_eq!(
            frame.body(),
            format!("[{}] /room: ping", h.connection.id())
        );
        assert_eq!(frame.header("destination"), Some("/room"));
    }

    #[tokio::test]
    async fn custom_id_rekeys_connection() {
        let mut h = Harness::new();
        let _ = h.send("CONNECT\naccept-version:1.2\nid:alice\n\n\0");
        assert_eq!(h.next().header("session"), Some("alice"));
        assert!(h.ctx.registry.lookup(&ConnectionId::from("alice")).is_ok());
    }

    #[tokio::test]
    async fn taken_custom_id_is_rejected() {
        let mut h = Harness::new();
        let (tx, _rx) = mpsc::channel(1);
        let other = Arc::new(Connection::new(ConnectionId::from("bob"), tx));
        let _ = h.ctx.registry.register(other).unwrap();

        assert_eq!(
            h.send("CONNECT\naccept-version:1.2\nid:bob\n\n\0"),
            HandleResult::Continue
        );
        assert_eq!(h.next().header("message"), Some(DUPLICATE_ID));
        assert_eq!(h.session.state(), SessionState::AwaitingConnect);
    }

    #[tokio::test]
    async fn disconnect_sends_receipt_and_closes() {
        let mut h = Harness::new();
        h.connect();
        assert_eq!(h.send("DISCONNECT\nreceipt:bye\n\n\0"), HandleResult::Close);
        assert_eq!(h.next().header("receipt-id"), Some("bye"));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.send("SEND\ndestination:/a\n\n\0"), HandleResult::Close);
    }

    #[tokio::test]
    async fn transactions_are_accepted() {
        let mut h = Harness::new();
        h.connect();
        for raw in ["BEGIN\ntransaction:t\n\n\0", "ACK\nid:1\n\n\0", "COMMIT\nreceipt:c\n\n\0"] {
            assert_eq!(h.send(raw), HandleResult::Continue);
        }
        assert_eq!(h.next().header("receipt-id"), Some("c"));
    }

    #[tokio::test]
    async fn bare_eol_is_a_heartbeat() {
        let mut h = Harness::new();
        assert_eq!(h.send("\n"), HandleResult::Continue);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_heartbeat_header_is_rejected() {
        let mut settings = XqwsSettings::default();
        settings.heartbeat.default_interval_ms = 0;
        let mut h = Harness::with_settings(settings);
        assert_eq!(
            h.send("CONNECT\naccept-version:1.2\nheart-beat:fast\n\n\0"),
            HandleResult::Continue
        );
        assert_eq!(h.next().command(), Command::Error);
    }
}
