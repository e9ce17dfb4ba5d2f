//! Host configuration - stored in $TRELLIS_HOME/config.json

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use trellis_proto::{Bearer, KeyIndex};

/// Get TRELLIS_HOME directory, creating it if needed
pub fn trellis_home() -> io::Result<PathBuf> {
    let home = std::env::var("TRELLIS_HOME").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".trellis")
    });

    if !home.exists() {
        fs::create_dir_all(&home)?;
    }

    Ok(home)
}

/// One model to wire up on every freshly provisioned node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: u16,
    #[serde(default)]
    pub publish_address: Option<u16>,
    #[serde(default)]
    pub subscribe_address: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub netkey_index: KeyIndex,
    pub appkey_index: KeyIndex,
    pub bearer: Bearer,
    /// Inventory scan window, seconds
    pub scan_window_secs: u64,
    /// How long a provision operation waits for its target to beacon, seconds
    pub target_wait_secs: u64,
    /// Per configuration request response timeout, milliseconds
    pub step_timeout_ms: u64,
    /// Retries for read-only configuration requests
    pub read_retry_limit: u8,
    /// Delay between node-reset ack and hardware reset, milliseconds
    pub settle_delay_ms: u64,
    pub models: Vec<ModelConfig>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            netkey_index: 0,
            appkey_index: 0,
            bearer: Bearer::Adv,
            scan_window_secs: 5,
            target_wait_secs: 30,
            step_timeout_ms: 5000,
            read_retry_limit: 2,
            settle_delay_ms: 500,
            // Generic OnOff server, publishing and subscribed to the default
            // group, is what the stock firmware ships with.
            models: vec![ModelConfig {
                model_id: 0x1000,
                publish_address: Some(0xC000),
                subscribe_address: Some(0xC000),
            }],
        }
    }
}

impl ProvisionerConfig {
    /// Load config from the home directory, writing the defaults there on
    /// first run.
    pub fn load_or_create(home: &Path) -> io::Result<Self> {
        let path = home.join("config.json");

        if path.exists() {
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str(&data) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config file does not parse, using defaults");
                    Ok(Self::default())
                }
            }
        } else {
            let config = Self::default();
            fs::write(&path, serde_json::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn target_wait(&self) -> Duration {
        Duration::from_secs(self.target_wait_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = ProvisionerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProvisionerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let parsed: ProvisionerConfig =
            serde_json::from_str(r#"{ "netkey_index": 3, "scan_window_secs": 12 }"#).unwrap();
        assert_eq!(parsed.netkey_index, 3);
        assert_eq!(parsed.scan_window_secs, 12);
        assert_eq!(parsed.step_timeout_ms, ProvisionerConfig::default().step_timeout_ms);
    }

    #[test]
    fn first_run_writes_the_default_file() {
        let dir = std::env::temp_dir().join(format!("trellis-config-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let config = ProvisionerConfig::load_or_create(&dir).unwrap();
        assert_eq!(config, ProvisionerConfig::default());
        assert!(dir.join("config.json").exists());

        // Second load reads the file it just wrote.
        let reloaded = ProvisionerConfig::load_or_create(&dir).unwrap();
        assert_eq!(reloaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }
}
