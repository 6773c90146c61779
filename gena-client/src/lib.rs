//! GENA event subscription client
//!
//! Implements the three subscription requests of the UPnP eventing
//! architecture over blocking HTTP:
//!
//! - initial `SUBSCRIBE` with `CALLBACK`, `NT` and `TIMEOUT`
//! - renewal `SUBSCRIBE` with `SID` and `TIMEOUT`
//! - `UNSUBSCRIBE` with `SID`
//!
//! All methods block the calling thread for at most the configured timeout.

mod error;

pub use error::GenaError;

use std::time::Duration;

/// Response from an initial subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResponse {
    /// Subscription ID returned by the publisher
    pub sid: String,
    /// Duration actually granted by the publisher
    pub timeout: Duration,
}

/// Blocking GENA client
#[derive(Debug, Clone)]
pub struct GenaClient {
    agent: ureq::Agent,
}

impl GenaClient {
    /// Create a client whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout_read(timeout)
                .timeout_write(timeout)
                .build(),
        }
    }

    /// Subscribe to events published at `event_sub_url`
    ///
    /// # Arguments
    /// * `event_sub_url` - Absolute event subscription URL of the service
    /// * `callback_url` - URL where NOTIFY requests should be delivered
    /// * `timeout` - Requested subscription duration
    ///
    /// # Returns
    /// The SID and the duration the publisher granted
    pub fn subscribe(
        &self,
        event_sub_url: &str,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<SubscriptionResponse, GenaError> {
        let response = self
            .agent
            .request("SUBSCRIBE", event_sub_url)
            .set("CALLBACK", &format!("<{}>", callback_url))
            .set("NT", "upnp:event")
            .set("TIMEOUT", &format_timeout(timeout))
            .call()?;

        ensure_success(response.status(), "SUBSCRIBE")?;

        let sid = response
            .header("SID")
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| GenaError::Parse("Missing SID header in SUBSCRIBE response".to_string()))?
            .to_string();

        let granted = parse_timeout(response.header("TIMEOUT"), timeout);
        tracing::debug!("Subscribed to {} as {} for {:?}", event_sub_url, sid, granted);

        Ok(SubscriptionResponse {
            sid,
            timeout: granted,
        })
    }

    /// Renew an existing subscription
    ///
    /// # Returns
    /// The duration granted by the publisher
    pub fn renew(
        &self,
        event_sub_url: &str,
        sid: &str,
        timeout: Duration,
    ) -> Result<Duration, GenaError> {
        let response = self
            .agent
            .request("SUBSCRIBE", event_sub_url)
            .set("SID", sid)
            .set("TIMEOUT", &format_timeout(timeout))
            .call()?;

        ensure_success(response.status(), "SUBSCRIBE renewal")?;

        let granted = parse_timeout(response.header("TIMEOUT"), timeout);
        tracing::debug!("Renewed {} for {:?}", sid, granted);
        Ok(granted)
    }

    /// Cancel a subscription
    pub fn unsubscribe(&self, event_sub_url: &str, sid: &str) -> Result<(), GenaError> {
        let response = self
            .agent
            .request("UNSUBSCRIBE", event_sub_url)
            .set("SID", sid)
            .call()?;

        ensure_success(response.status(), "UNSUBSCRIBE")?;
        tracing::debug!("Unsubscribed {}", sid);
        Ok(())
    }
}

impl Default for GenaClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn ensure_success(status: u16, request: &str) -> Result<(), GenaError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        tracing::debug!("{} failed: HTTP {}", request, status);
        Err(GenaError::Status(status))
    }
}

fn format_timeout(timeout: Duration) -> String {
    format!("Second-{}", timeout.as_secs().max(1))
}

/// Longest granted timeout accepted from a publisher
pub const MAX_GRANTED_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Parse a `TIMEOUT: Second-N` header.
///
/// `Second-infinite`, a missing header or an unparsable value all mean the
/// requested duration was granted. Grants above [`MAX_GRANTED_TIMEOUT`] are
/// clamped to it.
pub fn parse_timeout(header: Option<&str>, requested: Duration) -> Duration {
    header
        .map(str::trim)
        .and_then(|value| {
            let prefix = value.get(..7)?;
            if prefix.eq_ignore_ascii_case("Second-") {
                value[7..].trim().parse::<u64>().ok()
            } else {
                None
            }
        })
        .map(|secs| Duration::from_secs(secs).min(MAX_GRANTED_TIMEOUT))
        .unwrap_or(requested)
}
