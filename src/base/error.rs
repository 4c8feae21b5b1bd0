//! Crate-wide error taxonomy.
//!
//! Every failure surfaces as a [`SockError`]. Each variant carries a
//! stable negative code for callers that log or persist statuses;
//! engine-level failures with no mapping keep their raw OS code in
//! [`SockError::Provider`].

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SockResult<T> = Result<T, SockError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockError {
    #[error("stack not initialized")]
    NotInitialized,
    #[error("invalid socket handle")]
    InvalidHandle,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported for this socket class")]
    UnsupportedForClass,
    #[error("resource budget exhausted")]
    ResourceExhausted,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation pending")]
    Pending,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("socket not connected")]
    NotConnected,
    #[error("address already in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("sockets still open")]
    SocketsStillOpen,
    #[error("provider error {0}")]
    Provider(i32),
}

impl SockError {
    /// Stable numeric code for this error.
    pub fn as_i32(self) -> i32 {
        match self {
            SockError::NotInitialized => -1,
            SockError::InvalidHandle => -2,
            SockError::InvalidArgument => -3,
            SockError::UnsupportedForClass => -4,
            SockError::ResourceExhausted => -5,
            SockError::Timeout => -6,
            SockError::Cancelled => -7,
            SockError::Pending => -8,
            SockError::ConnectionReset => -9,
            SockError::ConnectionRefused => -10,
            SockError::ConnectionAborted => -11,
            SockError::NotConnected => -12,
            SockError::AddressInUse => -13,
            SockError::AddressNotAvailable => -14,
            SockError::SocketsStillOpen => -15,
            SockError::Provider(code) => code,
        }
    }
}

impl From<i32> for SockError {
    fn from(code: i32) -> Self {
        match code {
            -1 => SockError::NotInitialized,
            -2 => SockError::InvalidHandle,
            -3 => SockError::InvalidArgument,
            -4 => SockError::UnsupportedForClass,
            -5 => SockError::ResourceExhausted,
            -6 => SockError::Timeout,
            -7 => SockError::Cancelled,
            -8 => SockError::Pending,
            -9 => SockError::ConnectionReset,
            -10 => SockError::ConnectionRefused,
            -11 => SockError::ConnectionAborted,
            -12 => SockError::NotConnected,
            -13 => SockError::AddressInUse,
            -14 => SockError::AddressNotAvailable,
            -15 => SockError::SocketsStillOpen,
            other => SockError::Provider(other),
        }
    }
}

impl From<std::io::Error> for SockError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => SockError::Timeout,
            ErrorKind::ConnectionReset => SockError::ConnectionReset,
            ErrorKind::ConnectionRefused => SockError::ConnectionRefused,
            ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => SockError::ConnectionAborted,
            ErrorKind::NotConnected => SockError::NotConnected,
            ErrorKind::AddrInUse => SockError::AddressInUse,
            ErrorKind::AddrNotAvailable => SockError::AddressNotAvailable,
            ErrorKind::InvalidInput => SockError::InvalidArgument,
            ErrorKind::Interrupted => SockError::Cancelled,
            _ => SockError::Provider(err.raw_os_error().unwrap_or(-1000)),
        }
    }
}
