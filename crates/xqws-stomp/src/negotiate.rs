//! Handshake negotiation: protocol version and heart-beat intervals.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FrameError;

/// Protocol versions this codec speaks, oldest first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.0", "1.1", "1.2"];

/// Pick the highest supported version listed in an `accept-version` header.
pub fn negotiate_version(accept_version: &str) -> Option<&'static str> {
    let offered: Vec<&str> = accept_version.split(',').map(str::trim).collect();
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .copied()
        .find(|v| offered.contains(v))
}

/// A `heart-beat` header value: `send_ms,receive_ms`.
///
/// `send_ms` is the smallest interval at which the sender can emit
/// heart-beats, `receive_ms` the interval it would like to receive them.
/// Zero means "cannot" / "does not want".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Outgoing interval in milliseconds.
    pub send_ms: u64,
    /// Desired incoming interval in milliseconds.
    pub receive_ms: u64,
}

impl HeartBeat {
    /// Build from both intervals.
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }
}

impl FromStr for HeartBeat {
    type Err = FrameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || FrameError::protocol(format!("invalid heart-beat header '{value}'"));
        let (send, receive) = value.split_once(',').ok_or_else(invalid)?;
        let send_ms = send.trim().parse().map_err(|_| invalid())?;
        let receive_ms = receive.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(send_ms, receive_ms))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

/// Outcome of heart-beat negotiation, seen from the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiatedHeartBeat {
    /// How often the client promised activity; drives the liveness monitor.
    pub incoming: Option<Duration>,
    /// How often the server sends keep-alive EOLs.
    pub outgoing: Option<Duration>,
}

impl NegotiatedHeartBeat {
    /// Combine the client's header with the server's own capabilities.
    ///
    /// Each direction uses the larger of the two offers and is disabled when
    /// either side offers zero.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> Self {
        Self {
            incoming: direction(client.send_ms, server.receive_ms),
            outgoing: direction(server.send_ms, client.receive_ms),
        }
    }
}

fn direction(sender_ms: u64, receiver_ms: u64) -> Option<Duration> {
    (sender_ms > 0 && receiver_ms > 0).then(|| Duration::from_millis(sender_ms.max(receiver_ms)))
}
