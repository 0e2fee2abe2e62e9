use anyhow::{Context, Result};
use derive_more::{Display, Error};
use log::{debug, info, warn, LevelFilter};
use roverlink_protocol::{is_valid_token, Role, WireFormat};
use roverlink_telemetry_log::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            _ => Err(format!("unknown log level {s:?}")),
        }
    }
}

/// Settings that cannot be repaired with a default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ConfigError {
    #[display("admin role requires a token")]
    MissingToken,
    #[display("token must not contain whitespace or control characters")]
    InvalidToken,
    #[display("poll interval must be at least one second")]
    ZeroPollInterval,
}

/// Client configuration
///
/// Every field has a default, so a partial JSON file (or none at all) is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Vehicle service host
    #[serde(default = "default_host")]
    pub host: String,
    /// Vehicle service port
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub role: Role,
    /// Admin token. Required for the admin role, never sent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub wire_format: WireFormat,
    /// Periodically ask for fresh data (structured format only)
    #[serde(default = "default_poll_enabled")]
    pub poll_enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Directory for the daily telemetry log
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for the handshake reply (0 = don't wait)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    5000
}

const fn default_poll_enabled() -> bool {
    true
}

const fn default_poll_interval_secs() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            role: Role::default(),
            token: None,
            wire_format: WireFormat::default(),
            poll_enabled: default_poll_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
            log_dir: default_log_dir(),
            log_format: LogFormat::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            log_level: LogLevel::default(),
        }
    }
}

impl ClientConfig {
    /// Fix values that have an obvious replacement
    pub fn normalize(&mut self) {
        if self.host.trim().is_empty() {
            warn!("Host is empty, resetting to default");
            self.host = default_host();
        }
        if self.connect_timeout_ms == 0 {
            warn!("connect_timeout_ms must be positive, resetting to default");
            self.connect_timeout_ms = default_connect_timeout_ms();
        }
        // Tokens are sent as a single line; whitespace around them is never meaningful
        self.token = self
            .token
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if self.role == Role::Observer && self.token.is_some() {
            debug!("Ignoring token for observer role");
            self.token = None;
        }
    }

    /// Check the settings a connection cannot start without.
    ///
    /// Run after `normalize()` and after any command line overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role == Role::Admin && self.token.is_none() {
            return Err(ConfigError::MissingToken);
        }
        if self.token.as_deref().is_some_and(|t| !is_valid_token(t)) {
            return Err(ConfigError::InvalidToken);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when the client should not wait for the handshake reply
    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let json = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Self = serde_json::from_slice(&json)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.normalize();
        debug!(
            "Config parsed: host={}:{}, role={}, wire_format={}",
            config.host, config.port, config.role, config.wire_format
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("writing config file {}", path.display()))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert_eq!(config.role, Role::Observer);
        assert_eq!(config.wire_format, WireFormat::Structured);
        assert!(config.poll_enabled);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Tabular);
        assert_eq!(config.log_level.as_level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{"role":"admin","token":"  SECRETO_2025 ","wire_format":"tokenized","log_format":"jsonl"}"#;
        let mut config: ClientConfig = serde_json::from_str(json).unwrap();
        config.normalize();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.role, Role::Admin);
        assert_eq!(config.token.as_deref(), Some("SECRETO_2025"));
        assert_eq!(config.wire_format, WireFormat::Tokenized);
        assert_eq!(config.log_format, LogFormat::RecordStream);
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_normalize_fixes_values() {
        let mut config = ClientConfig {
            host: " ".to_string(),
            connect_timeout_ms: 0,
            token: Some("secret".to_string()),
            handshake_timeout_ms: 0,
            ..ClientConfig::default()
        };
        config.normalize();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        // Observers never carry a token
        assert_eq!(config.token, None);
        assert_eq!(config.handshake_timeout(), None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects() {
        let mut admin = ClientConfig {
            role: Role::Admin,
            token: Some("  ".to_string()),
            ..ClientConfig::default()
        };
        admin.normalize();
        assert_eq!(admin.validate(), Err(ConfigError::MissingToken));

        let mut injected = ClientConfig {
            role: Role::Admin,
            token: Some("SECRETO_2025\nCOMMAND SELF DESTRUCT".to_string()),
            ..ClientConfig::default()
        };
        injected.normalize();
        assert_eq!(injected.validate(), Err(ConfigError::InvalidToken));

        let polling = ClientConfig {
            poll_interval_secs: 0,
            ..ClientConfig::default()
        };
        assert_eq!(polling.validate(), Err(ConfigError::ZeroPollInterval));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("roverlink-config-{}.json", std::process::id()));
        let config = ClientConfig {
            role: Role::Admin,
            token: Some("abc".to_string()),
            port: 6000,
            ..ClientConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);

        assert!(ClientConfig::load(&path).is_err());
    }
}
