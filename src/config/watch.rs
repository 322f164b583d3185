//! Watch subsystem tuning
//!
//! ```toml
//! [watch]
//! default_poll_rate_ms = 5000
//! min_poll_rate_ms = 500
//! batch_window_ms = 0
//! subscription_display = "haystack-client"
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Poll-rate and batching parameters shared by every watch created through a
/// [`WatchService`](crate::WatchService).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// Interval between polls until the server reports its own rate
    ///
    /// Default: 5000 (5 seconds)
    #[serde(default = "default_poll_rate_ms")]
    pub default_poll_rate_ms: u64,

    /// Floor applied to server-reported poll rates
    ///
    /// Default: 500
    #[serde(default = "default_min_poll_rate_ms")]
    pub min_poll_rate_ms: u64,

    /// How long add/remove requests are collected before one flush
    ///
    /// - `0` (default): flush on the next scheduler turn, coalescing every
    ///   request made by tasks that are ready in the same tick
    /// - `>0`: debounce window in milliseconds
    #[serde(default)]
    pub batch_window_ms: u64,

    /// Display name sent with the network open call
    #[serde(default = "default_subscription_display")]
    pub subscription_display: String,
}

fn default_poll_rate_ms() -> u64 {
    5000
}

fn default_min_poll_rate_ms() -> u64 {
    500
}

fn default_subscription_display() -> String {
    "haystack-client".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_poll_rate_ms: default_poll_rate_ms(),
            min_poll_rate_ms: default_min_poll_rate_ms(),
            batch_window_ms: 0,
            subscription_display: default_subscription_display(),
        }
    }
}

impl WatchConfig {
    pub fn default_poll_rate(&self) -> Duration {
        Duration::from_millis(self.default_poll_rate_ms)
    }

    pub fn min_poll_rate(&self) -> Duration {
        Duration::from_millis(self.min_poll_rate_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Clamps a server-reported rate. `None` means the report carried no
    /// usable rate and the current one should be kept.
    pub(crate) fn effective_poll_rate(
        &self,
        reported: Duration,
    ) -> Option<Duration> {
        if reported.is_zero() {
            return None;
        }
        Some(reported.max(self.min_poll_rate()))
    }

    /// Validates configuration parameters
    ///
    /// Returns error if:
    /// - either poll rate is zero
    /// - `min_poll_rate_ms` exceeds `default_poll_rate_ms`
    /// - `subscription_display` is empty
    pub fn validate(&self) -> Result<()> {
        if self.default_poll_rate_ms == 0 || self.min_poll_rate_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch poll rates must be greater than zero".to_string(),
            )));
        }

        if self.min_poll_rate_ms > self.default_poll_rate_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "min_poll_rate_ms ({}) cannot exceed default_poll_rate_ms ({})",
                self.min_poll_rate_ms, self.default_poll_rate_ms
            ))));
        }

        if self.subscription_display.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "subscription_display cannot be empty".to_string(),
            )));
        }

        Ok(())
    }
}
