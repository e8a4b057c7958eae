//! STOMP commands and the required-header table.

use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;
use crate::header;

/// A STOMP command token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Client handshake (STOMP 1.1+ alias of CONNECT).
    Stomp,
    /// Publish a message to a destination.
    Send,
    /// Register interest in a destination.
    Subscribe,
    /// Drop a subscription.
    Unsubscribe,
    /// Start a transaction (accepted, not applied).
    Begin,
    /// Commit a transaction (accepted, not applied).
    Commit,
    /// Abort a transaction (accepted, not applied).
    Abort,
    /// Acknowledge a message (accepted, not applied).
    Ack,
    /// Negative acknowledgement (accepted, not applied).
    Nack,
    /// Graceful client disconnect.
    Disconnect,
    /// Server handshake reply.
    Connected,
    /// Server-delivered message.
    Message,
    /// Server acknowledgement of a `receipt` header.
    Receipt,
    /// Server error report.
    Error,
}

impl Command {
    /// Every command, client commands first.
    pub const ALL: [Self; 15] = [
        Self::Connect,
        Self::Stomp,
        Self::Send,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Begin,
        Self::Commit,
        Self::Abort,
        Self::Ack,
        Self::Nack,
        Self::Disconnect,
        Self::Connected,
        Self::Message,
        Self::Receipt,
        Self::Error,
    ];

    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Headers a frame with this command must carry to be valid.
    pub fn required_headers(self) -> &'static [&'static str] {
        match self {
            Self::Connect | Self::Stomp => &[header::ACCEPT_VERSION],
            Self::Send => &[header::DESTINATION],
            Self::Subscribe => &[header::DESTINATION, header::ID],
            Self::Unsubscribe => &[header::ID],
            Self::Message => &[header::DESTINATION, header::MESSAGE_ID, header::SUBSCRIPTION],
            Self::Connected => &[header::VERSION],
            Self::Receipt => &[header::RECEIPT_ID],
            Self::Disconnect
            | Self::Begin
            | Self::Commit
            | Self::Abort
            | Self::Ack
            | Self::Nack
            | Self::Error => &[],
        }
    }

    /// Whether clients may send this command.
    pub fn is_client_command(self) -> bool {
        !matches!(
            self,
            Self::Connected | Self::Message | Self::Receipt | Self::Error
        )
    }

    /// Whether this is one of the handshake commands (CONNECT/STOMP).
    pub fn is_connect(self) -> bool {
        matches!(self, Self::Connect | Self::Stomp)
    }

    /// Whether header names and values are escaped on the wire.
    ///
    /// Handshake frames are exempt so 1.0 peers can read them.
    pub fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }

    /// Whether the command is a transaction command.
    pub fn is_transactional(self) -> bool {
        matches!(self, Self::Begin | Self::Commit | Self::Abort)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == token)
            .ok_or_else(|| FrameError::protocol(format!("unknown command '{token}'")))
    }
}
