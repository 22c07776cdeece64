//! Eth3Bus Error Types
//!
//! Every failure is local to the operation that caused it. Nothing here is
//! fatal to a `BusConnection`; the next request reconnects lazily.

use thiserror::Error;

/// Result type for eth3bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Bus client errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// TCP handshake with the gateway failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Write failed on an established connection
    #[error("Write error: {0}")]
    Write(String),

    /// No qualifying reply before the deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Explicit NACK for the operation's destination
    #[error("Rejected by device {destination:#06X}")]
    Rejected { destination: u16 },

    /// Connection dropped (idle timeout, peer close, socket error)
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The bus connection driver has stopped
    #[error("Bus connection closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Write(err.to_string())
    }
}

impl From<figment::Error> for BusError {
    fn from(err: figment::Error) -> Self {
        BusError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl BusError {
    pub fn connect(msg: impl Into<String>) -> Self {
        BusError::Connect(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        BusError::Write(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BusError::Timeout(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        BusError::Disconnected(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BusError::Config(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        BusError::InvalidFrame(msg.into())
    }

    /// Check if this error means the transport was lost and the next
    /// request will open a fresh connection
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            BusError::Connect(_) | BusError::Write(_) | BusError::Disconnected(_)
        )
    }

    /// Check if this is a definitive negative answer from the bus
    pub fn is_rejected(&self) -> bool {
        matches!(self, BusError::Rejected { .. })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_needs_reconnect() {
        assert!(BusError::connect("refused").needs_reconnect());
        assert!(BusError::write("broken pipe").needs_reconnect());
        assert!(BusError::disconnected("idle").needs_reconnect());
        assert!(!BusError::timeout("no ack").needs_reconnect());
        assert!(!BusError::Rejected { destination: 49 }.needs_reconnect());
        assert!(!BusError::Closed.needs_reconnect());
    }

    #[test]
    fn test_rejected_display() {
        let err = BusError::Rejected { destination: 0x31 };
        assert_eq!(err.to_string(), "Rejected by device 0x0031");
        assert!(err.is_rejected());
    }

    #[test]
    fn test_io_error_maps_to_write() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(BusError::from(io), BusError::Write(_)));
    }
}
