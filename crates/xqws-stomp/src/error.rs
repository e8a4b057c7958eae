//! Codec errors.

use crate::command::Command;

/// Machine code for [`FrameError::Protocol`].
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// Machine code for [`FrameError::MissingHeader`].
pub const HEADER_ERROR: &str = "HEADER_ERROR";

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Malformed frame: unknown command, no header/body separator, missing
    /// terminator, bad header line.
    #[error("{message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A header required by the frame's command is absent.
    #[error("{command} frame requires header '{header}'")]
    MissingHeader {
        /// Command of the rejected frame.
        command: Command,
        /// Name of the missing header.
        header: &'static str,
    },
}

impl FrameError {
    /// Build a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => PROTOCOL_ERROR,
            Self::MissingHeader { .. } => HEADER_ERROR,
        }
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, FrameError>;
