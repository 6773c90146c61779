//! Configuration for the control point
//!
//! Timing knobs for the schedulers, sizing of the task substrate and the
//! network settings handed to the default collaborators.

use std::time::Duration;

use crate::error::ControlPointError;

/// Configuration for a [`ControlPoint`](crate::ControlPoint)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointConfig {
    /// Grace period added to the earliest device deadline before evicting
    /// Default: 10 seconds
    pub expiration_margin: Duration,

    /// How long before a subscription expires it is renewed
    /// Default: 10 seconds
    pub renewal_margin: Duration,

    /// Shortest wait of the renewal loop, also the retry delay after a failed renewal
    /// Default: 1 second
    pub renewal_floor: Duration,

    /// Failed renewals tolerated before a subscription is evicted
    /// Default: 1 (two consecutive failures evict)
    pub max_renewal_retries: u32,

    /// Subscription duration requested from publishers
    /// Default: 300 seconds
    pub subscription_timeout: Duration,

    /// Timeout for description loads and GENA requests
    /// Default: 10 seconds
    pub network_timeout: Duration,

    /// Worker threads of the parallel pool
    /// Default: available parallelism, at least 2
    pub parallel_workers: usize,

    /// Bounded wait used when draining the task substrate
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,

    /// Port range for the NOTIFY callback server
    /// Default: (49152, 49252)
    pub callback_port_range: (u16, u16),

    /// MX value of outgoing M-SEARCH requests
    /// Default: 2
    pub search_mx: u32,

    /// Search target used when `search` is called without one
    /// Default: `ssdp:all`
    pub default_search_target: String,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            expiration_margin: Duration::from_secs(10),
            renewal_margin: Duration::from_secs(10),
            renewal_floor: Duration::from_secs(1),
            max_renewal_retries: 1,
            subscription_timeout: Duration::from_secs(300),
            network_timeout: Duration::from_secs(10),
            parallel_workers: default_parallel_workers(),
            shutdown_timeout: Duration::from_secs(5),
            callback_port_range: (49152, 49252),
            search_mx: 2,
            default_search_target: "ssdp:all".to_string(),
        }
    }
}

fn default_parallel_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

impl ControlPointConfig {
    /// Create a new ControlPointConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return the first issue found
    pub fn validate(&self) -> Result<(), ControlPointError> {
        if self.callback_port_range.0 > self.callback_port_range.1 {
            return Err(ControlPointError::Configuration(
                "Invalid callback port range: start must not exceed end".to_string(),
            ));
        }

        if self.subscription_timeout.is_zero() {
            return Err(ControlPointError::Configuration(
                "Subscription timeout must be greater than 0".to_string(),
            ));
        }

        if self.renewal_floor.is_zero() {
            return Err(ControlPointError::Configuration(
                "Renewal floor must be greater than 0".to_string(),
            ));
        }

        if self.network_timeout.is_zero() {
            return Err(ControlPointError::Configuration(
                "Network timeout must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ControlPointError::Configuration(
                "Shutdown timeout must be greater than 0".to_string(),
            ));
        }

        if self.parallel_workers == 0 {
            return Err(ControlPointError::Configuration(
                "Parallel workers must be greater than 0".to_string(),
            ));
        }

        if self.search_mx == 0 {
            return Err(ControlPointError::Configuration(
                "Search MX must be at least 1".to_string(),
            ));
        }

        if self.default_search_target.trim().is_empty() {
            return Err(ControlPointError::Configuration(
                "Default search target must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_expiration_margin(mut self, margin: Duration) -> Self {
        self.expiration_margin = margin;
        self
    }

    pub fn with_renewal(mut self, margin: Duration, floor: Duration, max_retries: u32) -> Self {
        self.renewal_margin = margin;
        self.renewal_floor = floor;
        self.max_renewal_retries = max_retries;
        self
    }

    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_callback_ports(mut self, start: u16, end: u16) -> Self {
        self.callback_port_range = (start, end);
        self
    }

    pub fn with_search(mut self, target: impl Into<String>, mx: u32) -> Self {
        self.default_search_target = target.into();
        self.search_mx = mx;
        self
    }
}
