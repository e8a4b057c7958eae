//! Contracts with the external query engine and value serializer.
//!
//! The engine itself lives outside this crate. The server only needs to hand
//! it query text with string bindings and get back a [`QueryValue`] (or an
//! [`EvaluationError`]), and to turn values into wire payloads through a
//! [`ValueSerializer`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use xqws_core::ConnectionId;
use xqws_stomp::Headers;

use crate::websocket::AttributeStore;

/// Media type that forces a binary payload.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A value produced by query evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryValue {
    /// The empty sequence.
    Empty,
    /// A string item (or serialized node).
    Text(String),
    /// A binary item.
    Binary(Bytes),
    /// A sequence of items.
    Sequence(Vec<QueryValue>),
}

impl QueryValue {
    /// Visit every non-sequence item in order.
    fn for_each_item<'a>(&'a self, f: &mut impl FnMut(&'a QueryValue)) {
        match self {
            Self::Empty => {}
            Self::Sequence(items) => {
                for item in items {
                    item.for_each_item(&mut *f);
                }
            }
            item => f(item),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for QueryValue {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

/// Serialization and framing options for one delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputOptions {
    /// Result media type; [`OCTET_STREAM`] forces a binary frame.
    pub media_type: Option<String>,
    /// Separator between sequence items (default `"\n"`).
    pub item_separator: Option<String>,
    /// `destination` header of the MESSAGE frame.
    pub destination: Option<String>,
    /// Extra headers copied onto the MESSAGE frame.
    pub headers: Headers,
}

impl OutputOptions {
    /// Options targeting a destination.
    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    /// Builder: add a MESSAGE header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(key, value);
        self
    }
}

/// External variable bindings, name to string value.
pub type Bindings = BTreeMap<String, String>;

/// One evaluation request.
///
/// Requests submitted through the bridge carry the submitting connection's
/// id and attribute store, so query code can keep per-connection state
/// across evaluations.
#[derive(Clone, Debug, Default)]
pub struct QueryRequest {
    /// Query text.
    pub query: String,
    /// External variable bindings.
    pub bindings: Bindings,
    /// Static base URI.
    pub base_uri: Option<String>,
    /// Connection that submitted the request.
    pub origin: Option<ConnectionId>,
    /// Attribute store of the submitting connection.
    pub attributes: Option<Arc<AttributeStore>>,
}

impl QueryRequest {
    /// Request with no bindings.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Builder: add a binding.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.bindings.insert(name.into(), value.into());
        self
    }
}

/// A query engine error (code such as `XPST0003`, plus description).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EvaluationError {
    /// Engine error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl EvaluationError {
    /// Build an evaluation error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Evaluates queries on behalf of connections.
#[async_trait]
pub trait QueryEvaluator: Send + Sync {
    /// Evaluate one request to completion.
    async fn evaluate(&self, request: QueryRequest) -> Result<QueryValue, EvaluationError>;
}

/// A query function bound to a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundFunction {
    /// Query text evaluated for each inbound message.
    pub query: String,
    /// Static base URI.
    pub base_uri: Option<String>,
}

/// A serialized value ready for the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Sent as a MESSAGE frame body.
    Text(String),
    /// Sent as a raw binary transport frame.
    Binary(Bytes),
}

/// The serializer rejected a value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("serialization failed: {message}")]
pub struct SerializeError {
    /// Description of the failure.
    pub message: String,
}

impl SerializeError {
    /// Build a serialization error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turns query values into wire payloads.
pub trait ValueSerializer: Send + Sync {
    /// Serialize `value` with `options`.
    fn serialize(
        &self,
        value: &QueryValue,
        options: &OutputOptions,
    ) -> Result<Payload, SerializeError>;
}

/// Default serializer.
///
/// A value made only of binary items becomes one binary payload. Anything
/// else becomes text with items joined by the separator and binary items
/// base64-encoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextSerializer;

impl ValueSerializer for TextSerializer {
    fn serialize(
        &self,
        value: &QueryValue,
        options: &OutputOptions,
    ) -> Result<Payload, SerializeError> {
        let mut items = Vec::new();
        value.for_each_item(&mut |item| items.push(item));

        let all_binary =
            !items.is_empty() && items.iter().all(|i| matches!(i, QueryValue::Binary(_)));
        if all_binary {
            let mut buf = BytesMut::new();
            for item in &items {
                if let QueryValue::Binary(b) = item {
                    buf.extend_from_slice(b);
                }
            }
            return Ok(Payload::Binary(buf.freeze()));
        }

        let separator = options.item_separator.as_deref().unwrap_or("\n");
        let mut text = String::new();
        for (n, item) in items.iter().enumerate() {
            if n > 0 {
                text.push_str(separator);
            }
            match item {
                QueryValue::Text(s) => text.push_str(s),
                QueryValue::Binary(b) => STANDARD.encode_string(b, &mut text),
                QueryValue::Empty | QueryValue::Sequence(_) => {}
            }
        }

        if options.media_type.as_deref() == Some(OCTET_STREAM) {
            return Ok(Payload::Binary(Bytes::from(text)));
        }
        Ok(Payload::Text(text))
    }
}
