//! TOML-based configuration for the Edge Link client.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\EdgeLink\config.toml`
//! - Linux:    `~/.config/edge-link/config.toml`
//! - macOS:    `~/Library/Application Support/EdgeLink/config.toml`
//!
//! Example:
//!
//! ```toml
//! [client]
//! display_name = "living-room-tablet"
//! log_level = "debug"
//!
//! [discovery]
//! port = 5592
//! silence_window_ms = 15000
//!
//! [session]
//! connect_timeout_ms = 5000
//! ```
//!
//! # Serde default values
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all) is a valid configuration, and a file written by an older version
//! keeps working when new fields are added.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::pair_device::DEFAULT_PAIR_TIMEOUT;
use crate::application::session_manager::{
    SessionConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
};
use crate::infrastructure::network::discovery::{DiscoveryConfig, DEFAULT_DISCOVERY_PORT};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub session: SessionSettings,
}

/// Identity and housekeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Name presented to devices during pairing.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where the registry, bookmarks and client key live.  Defaults to the
    /// platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Discovery loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySettings {
    /// UDP port devices announce themselves on.
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Length of one listening cycle.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// A device silent for longer than this leaves the snapshot.
    #[serde(default = "default_silence_window_ms")]
    pub silence_window_ms: u64,
    /// First retry delay after a failed scan cycle.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Pairing and connection timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pair_timeout_ms")]
    pub pair_timeout_ms: u64,
    /// Bound on tearing a session down before the entry is retired anyway.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_display_name() -> String {
    "edge-link".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_scan_interval_ms() -> u64 {
    1_000
}
fn default_silence_window_ms() -> u64 {
    10_000
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}
fn default_pair_timeout_ms() -> u64 {
    DEFAULT_PAIR_TIMEOUT.as_millis() as u64
}
fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT.as_millis() as u64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            log_level: default_log_level(),
            data_dir: None,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            scan_interval_ms: default_scan_interval_ms(),
            silence_window_ms: default_silence_window_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pair_timeout_ms: default_pair_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl DiscoverySettings {
    /// Address the announcement scanner listens on.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// The scanner listens for a whole cycle, so the loop adds no extra pause.
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            scan_interval: Duration::ZERO,
            silence_window: Duration::from_millis(self.silence_window_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..DiscoveryConfig::default()
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_millis(self.pair_timeout_ms)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolves the data directory: the configured one, else the platform default.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if nothing is configured and
/// the platform directory cannot be determined.
pub fn data_dir(config: &AppConfig) -> Result<PathBuf, ConfigError> {
    match &config.client.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => platform_data_dir().ok_or(ConfigError::NoPlatformConfigDir),
    }
}

/// Loads `AppConfig` from the platform config file.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("EdgeLink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("edge-link"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("EdgeLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Resolves the platform data directory.
fn platform_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // XDG_DATA_HOME or ~/.local/share
        let base = std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
            })?;
        Some(base.join("edge-link"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        platform_config_dir()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── AppConfig defaults ────────────────────────────────────────────────────

    #[test]
    fn test_app_config_default_has_expected_timeouts() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.session.connect_timeout_ms, 10_000);
        assert_eq!(cfg.session.pair_timeout_ms, 30_000);
        assert_eq!(cfg.session.to_session_config().connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(cfg.session.to_session_config().close_timeout, DEFAULT_CLOSE_TIMEOUT);
    }

    #[test]
    fn test_client_config_default_log_level_is_info() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.data_dir, None);
    }

    #[test]
    fn test_discovery_settings_convert_to_loop_config() {
        let settings = DiscoverySettings {
            silence_window_ms: 2_500,
            ..DiscoverySettings::default()
        };

        let loop_config = settings.to_discovery_config();

        assert_eq!(loop_config.silence_window, Duration::from_millis(2_500));
        assert_eq!(loop_config.scan_interval, Duration::ZERO);
        assert_eq!(settings.bind_addr().port(), DEFAULT_DISCOVERY_PORT);
    }

    // ── TOML parsing ──────────────────────────────────────────────────────────

    #[test]
    fn test_app_config_serializes_and_deserializes_round_trip() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.discovery.port = 9000;
        cfg.client.data_dir = Some(PathBuf::from("/var/lib/edge-link"));

        // Act
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AppConfig = toml::from_str(&toml_str).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_unset_data_dir_is_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(!toml_str.contains("data_dir"), "None data_dir must be omitted");
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_deserialize_partial_section_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[session]
connect_timeout_ms = 2500
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.session.connect_timeout_ms, 2500);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.session.pair_timeout_ms, 30_000);
        assert_eq!(cfg.client.display_name, "edge-link");
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    // ── load / save ───────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = load_config_from(&dir.path().join("missing.toml")).unwrap();

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_config_round_trip_via_temp_dir() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.client.log_level = "debug".to_string();

        // Act
        save_config_to(&path, &cfg).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded.client.log_level, "debug");
    }

    #[test]
    fn test_configured_data_dir_wins_over_platform_default() {
        let mut cfg = AppConfig::default();
        cfg.client.data_dir = Some(PathBuf::from("/srv/edge"));
        assert_eq!(data_dir(&cfg).unwrap(), PathBuf::from("/srv/edge"));
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("config.toml"),
                "config file must be named config.toml, got {path:?}"
            );
        }
        // NoPlatformConfigDir in a stripped environment is also acceptable.
    }
}
