//! Broker configuration.
//!
//! Every deadline and quota the protocol depends on is a tunable here,
//! not a wire constant. Values layer: serde defaults, then an optional
//! TOML file, then `MEMBROKER_`-prefixed environment variables
//! (e.g. `MEMBROKER_TIMING__RELEASE_TIMEOUT_MS=20`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerSection,
    pub timing: TimingConfig,
    pub limits: LimitsConfig,
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Control-channel bind address.
    pub bind: String,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7411".to_string(),
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Expected client heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// A session with no heartbeat for this long is declared dead.
    /// Kept at a small multiple of the interval to tolerate jitter.
    pub heartbeat_timeout_ms: u64,
    /// How long the reclaimer waits for a victim's voluntary ack before
    /// force-freeing the range.
    pub release_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 300,
            heartbeat_timeout_ms: 1200,
            release_timeout_ms: 50,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Quota applied to sessions that do not request one. `None` leaves
    /// them unlimited (quotas are advisory by default).
    pub default_quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity_bytes: u64,
    /// Physical base address of the region; opaque to the broker, carried
    /// for the driver-mapping collaborator.
    pub base_address: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1 << 30, // 1 GiB
            base_address: 0,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from an optional TOML file plus environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MEMBROKER")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: BrokerConfig = builder.build()?.try_deserialize()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one pool must be configured".to_string(),
            ));
        }
        if self.pools.iter().any(|p| p.capacity_bytes == 0) {
            return Err(Error::InvalidArgument(
                "pool capacity cannot be zero".to_string(),
            ));
        }
        if self.timing.heartbeat_interval_ms == 0
            || self.timing.heartbeat_timeout_ms < self.timing.heartbeat_interval_ms
        {
            return Err(Error::InvalidArgument(
                "heartbeat timeout must be at least the heartbeat interval".to_string(),
            ));
        }
        if self.timing.release_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "release timeout cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}
