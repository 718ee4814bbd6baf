use serde::Deserialize;
use std::time::Duration;

use crate::{SyncError, SyncResult};

/// Reconnection policy for the duplex channel
///
/// Delays grow geometrically from `min_delay_ms` by `grow_factor` after each
/// consecutive failure and never exceed `max_delay_ms`. A connection that stays
/// open for at least `min_uptime_ms` is considered stable and resets the growth.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffOptions {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub grow_factor: f64,
    pub min_uptime_ms: u64,
    /// How long a single connection attempt may take before it counts as failed
    pub connection_timeout_ms: u64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 10_000,
            grow_factor: 1.3,
            min_uptime_ms: 5_000,
            connection_timeout_ms: 4_000,
        }
    }
}

impl BackoffOptions {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn with_delays(mut self, min_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.min_delay_ms = min_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_grow_factor(mut self, grow_factor: f64) -> Self {
        self.grow_factor = grow_factor;
        self
    }

    pub fn with_min_uptime(mut self, min_uptime_ms: u64) -> Self {
        self.min_uptime_ms = min_uptime_ms;
        self
    }

    pub fn with_connection_timeout(mut self, connection_timeout_ms: u64) -> Self {
        self.connection_timeout_ms = connection_timeout_ms;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.min_delay_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "min_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err(SyncError::InvalidConfig(format!(
                "max_delay_ms ({}) is smaller than min_delay_ms ({})",
                self.max_delay_ms, self.min_delay_ms
            )));
        }
        if !self.grow_factor.is_finite() || self.grow_factor < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "grow_factor must be a finite number >= 1.0, got {}",
                self.grow_factor
            )));
        }
        Ok(())
    }
}

/// Options for a [`SyncClient`](crate::SyncClient)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// `host[:port]` of the cloud backend
    pub authority: String,
    pub use_ssl: bool,
    pub backoff: BackoffOptions,
    /// Capacity of the broadcast channel carrying unrouted server messages
    pub side_channel_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            authority: String::new(),
            use_ssl: true,
            backoff: BackoffOptions::default(),
            side_channel_capacity: 256,
        }
    }
}

impl ClientOptions {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            ..Self::default()
        }
    }

    pub fn with_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_side_channel_capacity(mut self, capacity: usize) -> Self {
        self.side_channel_capacity = capacity;
        self
    }

    /// Endpoint of the duplex channel
    pub fn ws_url(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.authority)
    }

    /// Endpoint of the unary dispatch channel
    pub fn dispatch_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}/dispatch", scheme, self.authority)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.authority.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "authority must not be empty".to_string(),
            ));
        }
        if self.side_channel_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "side_channel_capacity must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}
