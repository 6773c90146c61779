//! Error types for the control point.

use gena_client::GenaError;
use upnp_discovery::DiscoveryError;

/// Errors returned by [`ControlPoint`](crate::ControlPoint) operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlPointError {
    /// The operation needs a started control point
    #[error("Control point is not started")]
    NotStarted,

    /// The control point was terminated and cannot be restarted
    #[error("Control point has been terminated")]
    Terminated,

    /// No discovered device owns the given UDN
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The service has no active subscription
    #[error("Service is not subscribed: {0}")]
    NotSubscribed(String),

    /// A subscription could not be created
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Loading a device description failed
    #[error("Description load failed: {0}")]
    Load(#[from] DiscoveryError),

    /// A GENA request failed
    #[error("Event request failed: {0}")]
    Event(#[from] GenaError),

    /// A network collaborator could not be started or used
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Convenience type alias for Results using ControlPointError.
pub type Result<T> = std::result::Result<T, ControlPointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ControlPointError::NotStarted.to_string(),
            "Control point is not started"
        );
        assert_eq!(
            ControlPointError::DeviceNotFound("uuid:abc".to_string()).to_string(),
            "Device not found: uuid:abc"
        );
        assert_eq!(
            ControlPointError::Configuration("bad".to_string()).to_string(),
            "Configuration error: bad"
        );
    }

    #[test]
    fn test_error_conversions() {
        let error: ControlPointError = GenaError::Status(412).into();
        assert!(matches!(error, ControlPointError::Event(GenaError::Status(412))));

        let error: ControlPointError = DiscoveryError::InvalidDevice("no udn".to_string()).into();
        assert!(matches!(error, ControlPointError::Load(_)));
        assert!(error.to_string().contains("no udn"));
    }
}
