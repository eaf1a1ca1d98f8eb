use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use super::station::TomlStation;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub stations: StationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// TCP address the control socket binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Persisted state (volume, unplayable set, last station).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Override for the mpv binary; otherwise looked up beside the
    /// executable and on PATH.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Extra arguments appended to the player command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Tuning for the error-recovery ladder.  Rung order is configurable rather
/// than hard-coded; the defaults implement the documented ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Bounded in-place retries per candidate URL before escalating.
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Backoff unit: retry N waits N × this many milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Segmented backend: manifest fetch timeout.
    #[serde(default = "default_manifest_timeout_secs")]
    pub manifest_timeout_secs: u64,
    /// Segmented backend: internal re-fetches after the first manifest
    /// attempt, absorbed without involving the ladder.
    #[serde(default = "default_manifest_retries")]
    pub manifest_retries: u32,
    /// Try the relay wrap (access errors) before the fallback URL.
    #[serde(default = "default_true")]
    pub relay_before_fallback: bool,
    /// Decode errors get one in-place pipeline rebuild before giving up.
    #[serde(default = "default_true")]
    pub rebuild_on_decode: bool,
}

/// Station list sources, consumed by the catalog loading cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file.
    /// Defaults to `$XDG_CONFIG_HOME/retune/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// Optional URL for a remote JSON station list.  Empty disables.
    #[serde(default)]
    pub remote_url: String,
    /// Inline station entries, highest priority when present.
    #[serde(default, skip_serializing)]
    pub station: Vec<TomlStation>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            binary: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            manifest_timeout_secs: default_manifest_timeout_secs(),
            manifest_retries: default_manifest_retries(),
            relay_before_fallback: default_true(),
            rebuild_on_decode: default_true(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            remote_url: String::new(),
            station: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    platform::CONTROL_TCP_PORT
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    9922
}

fn default_relay_port() -> u16 {
    platform::RELAY_PORT
}

fn default_max_retries() -> u8 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_manifest_timeout_secs() -> u64 {
    20
}

fn default_manifest_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.daemon.bind_address, "127.0.0.1");
        assert_eq!(config.recovery.max_retries, 2);
        assert_eq!(config.recovery.retry_backoff_ms, 1000);
        assert_eq!(config.recovery.manifest_timeout_secs, 20);
        assert_eq!(config.recovery.manifest_retries, 3);
        assert!(config.recovery.relay_before_fallback);
        assert!(config.recovery.rebuild_on_decode);
        assert!(config
            .stations
            .stations_toml
            .ends_with("retune/stations.toml"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let toml = r#"
            [recovery]
            max_retries = 1

            [[stations.station]]
            name = "Inline FM"
            stream_url = "https://example.com/inline.mp3"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.recovery.max_retries, 1);
        assert_eq!(config.recovery.retry_backoff_ms, 1000);
        assert_eq!(config.stations.station.len(), 1);
        assert!(config.http.enabled);
    }
}
