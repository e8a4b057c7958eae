//! # xqws-stomp
//!
//! STOMP frame codec used on top of WebSocket text frames.
//!
//! - [`Command`]: the closed set of client and server commands, with the
//!   required-header table
//! - [`Frame`]: command + ordered [`Headers`] + body; parsing fails instead
//!   of producing a frame that lacks its required headers
//! - [`negotiate`]: `accept-version` and `heart-beat` negotiation
//!
//! Wire contract: lines are terminated by LF (a CR before the LF is
//! tolerated on input), a blank line separates headers from body, and a NUL
//! byte terminates the frame.

#![deny(unsafe_code)]

pub mod command;
pub mod error;
pub mod frame;
pub mod headers;
pub mod negotiate;

pub use command::Command;
pub use error::{FrameError, Result};
pub use frame::{Frame, TERMINATOR, is_heartbeat};
pub use headers::Headers;
pub use negotiate::{HeartBeat, NegotiatedHeartBeat, SUPPORTED_VERSIONS, negotiate_version};

/// Well-known header names.
pub mod header {
    /// Versions a client accepts (CONNECT).
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Negotiated version (CONNECTED).
    pub const VERSION: &str = "version";
    /// Heart-beat intervals `sx,sy` in milliseconds.
    pub const HEART_BEAT: &str = "heart-beat";
    /// Virtual host (CONNECT).
    pub const HOST: &str = "host";
    /// Server identification (CONNECTED).
    pub const SERVER: &str = "server";
    /// Session identifier (CONNECTED).
    pub const SESSION: &str = "session";
    /// Message destination.
    pub const DESTINATION: &str = "destination";
    /// Subscription or custom connection id.
    pub const ID: &str = "id";
    /// Receipt request.
    pub const RECEIPT: &str = "receipt";
    /// Receipt acknowledgement (RECEIPT).
    pub const RECEIPT_ID: &str = "receipt-id";
    /// Message identifier (MESSAGE).
    pub const MESSAGE_ID: &str = "message-id";
    /// Subscription a MESSAGE is delivered for.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Short error description (ERROR).
    pub const MESSAGE: &str = "message";
    /// Body length in bytes.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// Body media type.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Transaction name.
    pub const TRANSACTION: &str = "transaction";
}
