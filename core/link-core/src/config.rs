//! Tuning knobs for the watchdog, identity debounce and recovery ladder.
//!
//! Loaded from `~/.sessionlink/link.toml` when present. Every field has a
//! default, so a missing file or a partial file is fine.

use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{LinkError, Result};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".sessionlink/link.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    #[serde(default = "default_fast_interval_secs")]
    pub fast_interval_secs: u64,
    #[serde(default = "default_slow_interval_secs")]
    pub slow_interval_secs: u64,
    #[serde(default = "default_prolonged_disconnect_secs")]
    pub prolonged_disconnect_secs: u64,
    #[serde(default = "default_stall_secs")]
    pub stall_secs: u64,
    #[serde(default = "default_scanning_stall_secs")]
    pub scanning_stall_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: default_fast_interval_secs(),
            slow_interval_secs: default_slow_interval_secs(),
            prolonged_disconnect_secs: default_prolonged_disconnect_secs(),
            stall_secs: default_stall_secs(),
            scanning_stall_secs: default_scanning_stall_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    #[serde(default = "default_fetch_debounce_ms")]
    pub fetch_debounce_ms: u64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            fetch_debounce_ms: default_fetch_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RecoveryConfig {
    #[serde(default = "default_auto_reconnect_delay_secs")]
    pub auto_reconnect_delay_secs: u64,
    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,
    #[serde(default = "default_full_cooldown_secs")]
    pub full_cooldown_secs: u64,
    #[serde(default = "default_deep_cooldown_secs")]
    pub deep_cooldown_secs: u64,
    #[serde(default = "default_max_tier_failures")]
    pub max_tier_failures: u32,
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_reconnect_delay_secs: default_auto_reconnect_delay_secs(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            full_cooldown_secs: default_full_cooldown_secs(),
            deep_cooldown_secs: default_deep_cooldown_secs(),
            max_tier_failures: default_max_tier_failures(),
            backoff_step_secs: default_backoff_step_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            failure_window_secs: default_failure_window_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct LinkConfig {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl LinkConfig {
    pub fn fast_interval(&self) -> Duration {
        secs(self.watchdog.fast_interval_secs)
    }

    pub fn slow_interval(&self) -> Duration {
        secs(self.watchdog.slow_interval_secs)
    }

    pub fn prolonged_disconnect(&self) -> Duration {
        secs(self.watchdog.prolonged_disconnect_secs)
    }

    pub fn stall_window(&self) -> Duration {
        secs(self.watchdog.stall_secs)
    }

    pub fn scanning_stall_window(&self) -> Duration {
        secs(self.watchdog.scanning_stall_secs)
    }

    pub fn fetch_debounce(&self) -> Duration {
        Duration::milliseconds(clamp_i64(self.account.fetch_debounce_ms))
    }

    pub fn auto_reconnect_delay(&self) -> Duration {
        secs(self.recovery.auto_reconnect_delay_secs)
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.recovery.call_timeout_secs)
    }

    pub fn validate(&self, origin: &Path) -> Result<()> {
        let malformed = |details: &str| LinkError::ConfigMalformed {
            path: origin.to_path_buf(),
            details: details.to_string(),
        };

        if self.watchdog.fast_interval_secs == 0 || self.watchdog.slow_interval_secs == 0 {
            return Err(malformed("watchdog intervals must be greater than zero"));
        }
        if self.watchdog.slow_interval_secs <= self.watchdog.fast_interval_secs {
            return Err(malformed(
                "watchdog.slow_interval_secs must be greater than fast_interval_secs",
            ));
        }
        if self.watchdog.stall_secs == 0 || self.watchdog.scanning_stall_secs == 0 {
            return Err(malformed("stall windows must be greater than zero"));
        }
        if self.recovery.max_tier_failures == 0 {
            return Err(malformed("recovery.max_tier_failures must be at least 1"));
        }
        if self.recovery.call_timeout_secs == 0 {
            return Err(malformed("recovery.call_timeout_secs must be greater than zero"));
        }
        if self.recovery.backoff_max_secs < self.recovery.backoff_step_secs {
            return Err(malformed(
                "recovery.backoff_max_secs must not be below backoff_step_secs",
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(LinkError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads the config from `path` (or the default location). A missing file
/// yields defaults; an unreadable or invalid file is an error.
pub fn load_config(path: Option<PathBuf>) -> Result<LinkConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(LinkConfig::default());
    }

    let content =
        fs_err::read_to_string(&config_path).map_err(|source| LinkError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;
    let config =
        toml::from_str::<LinkConfig>(&content).map_err(|err| LinkError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        })?;
    config.validate(&config_path)?;
    Ok(config)
}

fn secs(value: u64) -> Duration {
    Duration::seconds(clamp_i64(value))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX / 1_000_000)
}

fn default_fast_interval_secs() -> u64 {
    180
}

fn default_slow_interval_secs() -> u64 {
    900
}

fn default_prolonged_disconnect_secs() -> u64 {
    600
}

fn default_stall_secs() -> u64 {
    90
}

fn default_scanning_stall_secs() -> u64 {
    300
}

fn default_fetch_debounce_ms() -> u64 {
    5_000
}

fn default_auto_reconnect_delay_secs() -> u64 {
    5
}

fn default_retry_cooldown_secs() -> u64 {
    3
}

fn default_full_cooldown_secs() -> u64 {
    3
}

fn default_deep_cooldown_secs() -> u64 {
    8
}

fn default_max_tier_failures() -> u32 {
    3
}

fn default_backoff_step_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_call_timeout_secs() -> u64 {
    60
}
