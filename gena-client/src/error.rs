//! Error types for the GENA client

use thiserror::Error;

/// Errors that can occur while managing event subscriptions
#[derive(Debug, Error)]
pub enum GenaError {
    /// Transport failure: connection refused, timeout, DNS
    #[error("Network/HTTP error: {0}")]
    Network(String),

    /// The publisher answered with a non-success status
    #[error("Publisher rejected request: HTTP {0}")]
    Status(u16),

    /// Malformed or missing response headers
    #[error("Invalid response: {0}")]
    Parse(String),
}

impl From<ureq::Error> for GenaError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => GenaError::Status(code),
            ureq::Error::Transport(transport) => GenaError::Network(transport.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            GenaError::Status(412).to_string(),
            "Publisher rejected request: HTTP 412"
        );
        assert_eq!(
            GenaError::Parse("Missing SID header".to_string()).to_string(),
            "Invalid response: Missing SID header"
        );
    }
}
