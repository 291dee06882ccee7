//! Error types for the rfcomm library
//!
//! This module defines the error types used throughout the library and the
//! reason codes carried by every DLC and session close.

use std::fmt;
use thiserror::Error;

/// Errors raised while decoding a raw RFCOMM frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame check sequence mismatch")]
    BadChecksum,

    #[error("Frame truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Length field does not match frame size")]
    InvalidLength,

    #[error("Address field is missing the EA bit")]
    InvalidAddress,

    #[error("Unknown frame type 0x{0:02x}")]
    UnknownType(u8),
}

/// Errors raised while decoding a multiplexer control command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McError {
    #[error("Control command truncated")]
    Truncated,

    #[error("Malformed {0} command")]
    Malformed(&'static str),

    /// The type octet is not a command this implementation understands.
    /// Answered with a Non Supported Command response.
    #[error("Unsupported control command type 0x{ty:02x}")]
    Unsupported { ty: u8, cr: bool },
}

/// Errors returned to callers of the public API
#[derive(Error, Debug)]
pub enum RfcommError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Control command error: {0}")]
    Control(#[from] McError),

    #[error("Channel {0} already in use on this session")]
    Busy(u8),

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("Connection not established")]
    NotConnected,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed: {0}")]
    Closed(CloseReason),

    #[error("RFCOMM worker is not running")]
    WorkerGone,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for RFCOMM operations
pub type RfcommResult<T> = std::result::Result<T, RfcommError>;

/// Why a DLC or session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Closed by the local user
    Local,
    /// Peer sent DISC on an established channel
    RemoteDisconnect,
    /// Peer answered DM, or the listener refused the channel
    Refused,
    /// Peer tore down an established channel or session
    Reset,
    /// Connect, disconnect or authentication timer expired
    Timeout,
    /// Link security could not be raised to the required level
    Security,
    /// The underlying transport failed or closed
    Transport,
    /// The RFCOMM service is being torn down
    Shutdown,
}

impl CloseReason {
    /// POSIX errno equivalent, 0 for a normal closure
    pub fn errno(&self) -> i32 {
        match self {
            Self::Local | Self::RemoteDisconnect => 0,
            Self::Refused => libc::ECONNREFUSED,
            Self::Reset => libc::ECONNRESET,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Security => libc::EACCES,
            Self::Transport => libc::EIO,
            Self::Shutdown => libc::ESHUTDOWN,
        }
    }

    /// Whether this reason is a normal, error free closure
    pub fn is_normal(&self) -> bool {
        self.errno() == 0
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::RemoteDisconnect => write!(f, "disconnected by peer"),
            Self::Refused => write!(f, "connection refused"),
            Self::Reset => write!(f, "connection reset"),
            Self::Timeout => write!(f, "timed out"),
            Self::Security => write!(f, "security requirements not met"),
            Self::Transport => write!(f, "transport failure"),
            Self::Shutdown => write!(f, "service shut down"),
        }
    }
}

impl From<CloseReason> for RfcommError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Refused => RfcommError::ConnectionRefused,
            other => RfcommError::Closed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_errno() {
        assert!(CloseReason::Local.is_normal());
        assert!(CloseReason::RemoteDisconnect.is_normal());
        assert_eq!(CloseReason::Refused.errno(), libc::ECONNREFUSED);
        assert_eq!(CloseReason::Timeout.errno(), libc::ETIMEDOUT);
        assert!(!CloseReason::Transport.is_normal());
    }

    #[test]
    fn test_close_reason_into_error() {
        assert!(matches!(
            RfcommError::from(CloseReason::Refused),
            RfcommError::ConnectionRefused
        ));
        let err = RfcommError::from(CloseReason::Security);
        assert_eq!(err.to_string(), "Connection closed: security requirements not met");
    }
}
