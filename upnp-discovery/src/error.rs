//! Error types for discovery and description loading.

use thiserror::Error;

/// Errors raised while talking to devices or interpreting what they return.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Network-related errors (HTTP requests, unexpected status codes)
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed XML or URLs in a device description
    #[error("Parse error: {0}")]
    Parse(String),

    /// Description parsed but does not describe a usable device
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Socket or interface enumeration failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiscoveryError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network error: connection refused");

        let err = DiscoveryError::InvalidDevice("missing UDN".to_string());
        assert_eq!(err.to_string(), "Invalid device: missing UDN");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: DiscoveryError = io.into();
        assert!(matches!(err, DiscoveryError::Io(_)));
    }
}
