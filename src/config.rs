use std::{path::Path, sync::OnceLock, time::Duration};

use anyhow::Context;
use push_relay::{EncoderProfile, EncoderSettings, RelayPolicy};
use serde::{Deserialize, Serialize};

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "LITE_PUSH_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub listen: String,
    /// Largest binary message accepted from the client, in bytes.
    pub max_message_size: usize,
    /// Close the stream after this many seconds without a message; 0 disables.
    pub idle_timeout_secs: u64,
    pub failure_window_secs: u64,
    pub stop_grace_secs: u64,
    pub encoder: EncoderSettings,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_message_size: 512 * 10240,
            idle_timeout_secs: 60,
            failure_window_secs: 10,
            stop_grace_secs: 3,
            encoder: EncoderSettings::default(),
        }
    }
}

impl PushConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be greater than zero");
        }
        if self.encoder.program.as_os_str().is_empty() {
            anyhow::bail!("encoder.program must not be empty");
        }
        if self.encoder.target.stream_key.is_empty() {
            anyhow::bail!("encoder.target.stream_key must not be empty");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy {
            failure_window: Duration::from_secs(self.failure_window_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        }
    }

    pub fn encoder_profile(&self) -> EncoderProfile {
        EncoderProfile::from(&self.encoder)
    }
}

static CONFIG: OnceLock<PushConfig> = OnceLock::new();

/// Load the config named by [`CONFIG_ENV`], or the defaults when it is unset.
/// Later calls return the first loaded config.
pub fn load() -> anyhow::Result<&'static PushConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => PushConfig::from_file(Path::new(&path))?,
        None => PushConfig::default(),
    };
    Ok(CONFIG.get_or_init(|| config))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
