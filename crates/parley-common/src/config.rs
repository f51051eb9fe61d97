//! Key-exchange configuration.
//!
//! Values come from `PARLEY_*` environment variables or a JSON document.
//! Missing or unparsable variables fall back to the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default nonce retention window: 5 minutes.
pub const DEFAULT_NONCE_RETENTION_SECS: u64 = 300;
/// Default interval between nonce sweeps.
pub const DEFAULT_NONCE_SWEEP_INTERVAL_SECS: u64 = 30;
/// Default accepted clock skew for request timestamps, in either direction.
/// Must stay below half the retention window.
pub const DEFAULT_MAX_TIMESTAMP_SKEW_SECS: u64 = 120;
/// Default deadline for one client-side network round trip.
pub const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyExchangeConfig {
    /// How long an accepted nonce stays in the replay guard.
    pub nonce_retention_secs: u64,
    /// How often the replay guard drops expired nonces.
    pub nonce_sweep_interval_secs: u64,
    /// Maximum distance between a request timestamp and local time, past or
    /// future. Twice this must be shorter than `nonce_retention_secs`, so a
    /// request is stale before its nonce can be swept.
    pub max_timestamp_skew_secs: u64,
    /// Client-side deadline for each network round trip.
    pub exchange_timeout_secs: u64,
}

impl Default for KeyExchangeConfig {
    fn default() -> Self {
        Self {
            nonce_retention_secs: DEFAULT_NONCE_RETENTION_SECS,
            nonce_sweep_interval_secs: DEFAULT_NONCE_SWEEP_INTERVAL_SECS,
            max_timestamp_skew_secs: DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            exchange_timeout_secs: DEFAULT_EXCHANGE_TIMEOUT_SECS,
        }
    }
}

fn lookup_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

impl KeyExchangeConfig {
    /// Load from `PARLEY_NONCE_RETENTION_SECS`, `PARLEY_NONCE_SWEEP_INTERVAL_SECS`,
    /// `PARLEY_MAX_TIMESTAMP_SKEW_SECS` and `PARLEY_EXCHANGE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup. `from_env` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            nonce_retention_secs: lookup_u64(
                &lookup,
                "PARLEY_NONCE_RETENTION_SECS",
                DEFAULT_NONCE_RETENTION_SECS,
            ),
            nonce_sweep_interval_secs: lookup_u64(
                &lookup,
                "PARLEY_NONCE_SWEEP_INTERVAL_SECS",
                DEFAULT_NONCE_SWEEP_INTERVAL_SECS,
            ),
            max_timestamp_skew_secs: lookup_u64(
                &lookup,
                "PARLEY_MAX_TIMESTAMP_SKEW_SECS",
                DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            ),
            exchange_timeout_secs: lookup_u64(
                &lookup,
                "PARLEY_EXCHANGE_TIMEOUT_SECS",
                DEFAULT_EXCHANGE_TIMEOUT_SECS,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nonce_retention_secs == 0 {
            return Err(Error::config("nonce_retention_secs must be greater than 0"));
        }
        if self.nonce_sweep_interval_secs == 0 {
            return Err(Error::config(
                "nonce_sweep_interval_secs must be greater than 0",
            ));
        }
        if self.nonce_sweep_interval_secs > self.nonce_retention_secs {
            return Err(Error::config(format!(
                "nonce_sweep_interval_secs ({}) must not exceed nonce_retention_secs ({})",
                self.nonce_sweep_interval_secs, self.nonce_retention_secs
            )));
        }
        if self.max_timestamp_skew_secs == 0 {
            return Err(Error::config("max_timestamp_skew_secs must be greater than 0"));
        }
        if self.max_timestamp_skew_secs.saturating_mul(2) >= self.nonce_retention_secs {
            return Err(Error::config(format!(
                "max_timestamp_skew_secs ({}) must be less than half of nonce_retention_secs ({})",
                self.max_timestamp_skew_secs, self.nonce_retention_secs
            )));
        }
        if self.exchange_timeout_secs == 0 {
            return Err(Error::config("exchange_timeout_secs must be greater than 0"));
        }
        Ok(())
    }

    pub fn nonce_retention(&self) -> Duration {
        Duration::from_secs(self.nonce_retention_secs)
    }

    pub fn nonce_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.nonce_sweep_interval_secs)
    }

    pub fn max_timestamp_skew(&self) -> Duration {
        Duration::from_secs(self.max_timestamp_skew_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}
