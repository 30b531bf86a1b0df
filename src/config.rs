use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Tunables for the per-task poll loops and update channel. All waits are
/// long-poll budgets the worker blocks for, not local sleeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTaskConfig {
    /// Maximum time the worker may hold a status long-poll before answering.
    #[serde(default = "default_status_refresh_max_wait_ms")]
    pub status_refresh_max_wait_ms: u64,
    /// Budget for the best-effort final task info fetch at terminal state.
    #[serde(default = "default_info_fetch_max_wait_ms")]
    pub info_fetch_max_wait_ms: u64,
    /// Minimum spacing between dynamic filter fetches, keeping that channel
    /// on a coarser cadence than the status channel.
    #[serde(default = "default_dynamic_filter_min_interval_ms")]
    pub dynamic_filter_min_interval_ms: u64,
    /// Added on top of the long-poll max wait before a request is treated as
    /// a transport failure.
    #[serde(default = "default_request_timeout_grace_ms")]
    pub request_timeout_grace_ms: u64,
}

fn default_status_refresh_max_wait_ms() -> u64 {
    1000
}

fn default_info_fetch_max_wait_ms() -> u64 {
    3000
}

fn default_dynamic_filter_min_interval_ms() -> u64 {
    200
}

fn default_request_timeout_grace_ms() -> u64 {
    10_000
}

impl Default for RemoteTaskConfig {
    fn default() -> Self {
        RemoteTaskConfig {
            status_refresh_max_wait_ms: default_status_refresh_max_wait_ms(),
            info_fetch_max_wait_ms: default_info_fetch_max_wait_ms(),
            dynamic_filter_min_interval_ms: default_dynamic_filter_min_interval_ms(),
            request_timeout_grace_ms: default_request_timeout_grace_ms(),
        }
    }
}

impl RemoteTaskConfig {
    pub fn from_path(path: &str) -> Result<RemoteTaskConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: RemoteTaskConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.status_refresh_max_wait_ms == 0 {
            return Err(anyhow::anyhow!("status refresh max wait must be non-zero"));
        }
        if self.request_timeout_grace_ms < self.status_refresh_max_wait_ms {
            return Err(anyhow::anyhow!(
                "request timeout grace {}ms is shorter than the status long-poll wait {}ms",
                self.request_timeout_grace_ms,
                self.status_refresh_max_wait_ms
            ));
        }
        Ok(())
    }

    pub fn status_refresh_max_wait(&self) -> Duration {
        Duration::from_millis(self.status_refresh_max_wait_ms)
    }

    pub fn info_fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.info_fetch_max_wait_ms)
    }

    pub fn dynamic_filter_min_interval(&self) -> Duration {
        Duration::from_millis(self.dynamic_filter_min_interval_ms)
    }

    pub fn request_timeout_grace(&self) -> Duration {
        Duration::from_millis(self.request_timeout_grace_ms)
    }
}
