//! Configuration management for Battleground.
//!
//! Loads settings from `~/.config/battleground/config.toml` with environment overrides.

use crate::drivers::{DriverOptions, SystemPromptMode, DEFAULT_MAX_TOKENS};
use crate::http::{DEFAULT_TIMEOUT, DISCOVERY_TIMEOUT, STREAM_IDLE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_CHALLENGE_CONCURRENCY: usize = 8;
pub const DEFAULT_DISCOVERY_CONCURRENCY: usize = 1;

pub const SERVICES_FILE: &str = "services.toml";
pub const SECRETS_FILE: &str = "secrets.json";
pub const DISABLED_MODELS_FILE: &str = "disabled_models.json";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Seconds a stream may go without data before it fails.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeConfig {
    /// 0 means unbounded.
    #[serde(default = "default_challenge_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub system_prompt_mode: SystemPromptMode,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_verbosity")]
    pub log_verbosity: LogVerbosity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Minimal,
    #[default]
    Compact,
    Verbose,
}

// Default value functions
fn default_port() -> u16 { DEFAULT_PORT }
fn default_request_timeout() -> u64 { DEFAULT_TIMEOUT.as_secs() }
fn default_discovery_timeout() -> u64 { DISCOVERY_TIMEOUT.as_secs() }
fn default_stream_idle_timeout() -> u64 { STREAM_IDLE_TIMEOUT.as_secs() }
fn default_challenge_concurrency() -> usize { DEFAULT_CHALLENGE_CONCURRENCY }
fn default_discovery_concurrency() -> usize { DEFAULT_DISCOVERY_CONCURRENCY }
fn default_max_tokens() -> u32 { DEFAULT_MAX_TOKENS }
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("battleground")
}
fn default_verbosity() -> LogVerbosity { LogVerbosity::Compact }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self { max_concurrency: default_challenge_concurrency() }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { max_concurrency: default_discovery_concurrency() }
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            system_prompt_mode: SystemPromptMode::default(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { state_dir: default_state_dir() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { log_verbosity: default_verbosity() }
    }
}

impl StorageConfig {
    pub fn services_path(&self) -> PathBuf {
        self.state_dir.join(SERVICES_FILE)
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.state_dir.join(SECRETS_FILE)
    }

    pub fn disabled_models_path(&self) -> PathBuf {
        self.state_dir.join(DISABLED_MODELS_FILE)
    }
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("battleground")
            .join("config.toml")
    }

    /// Load config from file, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config with environment overrides applied (convenience method).
    pub fn load_with_env() -> Self {
        Self::load().unwrap_or_default().with_env_overrides()
    }

    /// Load config from a specific path.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Apply environment variable overrides. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = env_parse("BATTLEGROUND_PORT") {
            self.server.port = port;
        }
        if let Ok(dir) = std::env::var("BATTLEGROUND_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse("BATTLEGROUND_REQUEST_TIMEOUT_SECS") {
            self.http.request_timeout_secs = secs;
        }
        if let Some(limit) = env_parse("BATTLEGROUND_CHALLENGE_CONCURRENCY") {
            self.challenge.max_concurrency = limit;
        }
        self
    }

    /// Save config to file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, content).map_err(ConfigError::Io)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs)
    }

    /// Options handed to every protocol driver.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            request_timeout: self.request_timeout(),
            discovery_timeout: Duration::from_secs(self.http.discovery_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.http.stream_idle_timeout_secs),
            system_prompt_mode: self.anthropic.system_prompt_mode,
            anthropic_max_tokens: self.anthropic.max_tokens,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_config_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(&config_path, r#"
[server]
port = 9090

[challenge]
max_concurrency = 3

[storage]
state_dir = "/tmp/bg-state"
"#).unwrap();

        let config = Config::load_from(config_path).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.challenge.max_concurrency, 3);
        assert_eq!(config.storage.state_dir, PathBuf::from("/tmp/bg-state"));
        assert_eq!(config.discovery.max_concurrency, DEFAULT_DISCOVERY_CONCURRENCY);
    }

    #[test]
    fn returns_defaults_when_file_missing() {
        let config = Config::load_from(PathBuf::from("/nonexistent/path/config.toml")).unwrap();

        assert_eq!(config.server.port, 8787);
        assert_eq!(config.http.request_timeout_secs, 120);
        assert_eq!(config.challenge.max_concurrency, 8);
        assert_eq!(config.discovery.max_concurrency, 1);
        assert_eq!(config.anthropic.max_tokens, 1024);
        assert_eq!(config.anthropic.system_prompt_mode, SystemPromptMode::AsAssistant);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "[server\nport = ").unwrap();

        assert!(matches!(Config::load_from(config_path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overrides_port_and_state_dir_from_environment() {
        std::env::set_var("BATTLEGROUND_PORT", "4000");
        std::env::set_var("BATTLEGROUND_STATE_DIR", "/tmp/bg-env");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.storage.state_dir, PathBuf::from("/tmp/bg-env"));

        std::env::remove_var("BATTLEGROUND_PORT");
        std::env::remove_var("BATTLEGROUND_STATE_DIR");
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        std::env::remove_var("BATTLEGROUND_CHALLENGE_CONCURRENCY");

        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(&config_path, r#"
[challenge]
max_concurrency = 2
"#).unwrap();

        let config_from_file = Config::load_from(config_path.clone()).unwrap();
        assert_eq!(config_from_file.challenge.max_concurrency, 2);

        std::env::set_var("BATTLEGROUND_CHALLENGE_CONCURRENCY", "0");
        let config = Config::load_from(config_path).unwrap().with_env_overrides();

        assert_eq!(config.challenge.max_concurrency, 0);

        std::env::remove_var("BATTLEGROUND_CHALLENGE_CONCURRENCY");
    }

    #[test]
    fn ignores_unparsable_env_values() {
        std::env::set_var("BATTLEGROUND_REQUEST_TIMEOUT_SECS", "soon");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.http.request_timeout_secs, 120);

        std::env::remove_var("BATTLEGROUND_REQUEST_TIMEOUT_SECS");
    }

    #[test]
    fn saves_config_to_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        let config = Config {
            server: ServerConfig { port: 3000 },
            anthropic: AnthropicConfig {
                system_prompt_mode: SystemPromptMode::TopLevel,
                max_tokens: 4096,
            },
            ..Config::default()
        };

        config.save_to(config_path.clone()).unwrap();

        let loaded = Config::load_from(config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn creates_parent_directories_when_saving() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("deep").join("config.toml");

        let config = Config::default();
        config.save_to(config_path.clone()).unwrap();

        assert!(config_path.exists());
    }

    #[test]
    fn parses_all_log_verbosity_levels() {
        let dir = tempfile::tempdir().unwrap();

        for (value, expected) in [
            ("minimal", LogVerbosity::Minimal),
            ("compact", LogVerbosity::Compact),
            ("verbose", LogVerbosity::Verbose),
        ] {
            let config_path = dir.path().join(format!("config_{}.toml", value));
            fs::write(&config_path, format!(r#"
[app]
log_verbosity = "{}"
"#, value)).unwrap();

            let config = Config::load_from(config_path).unwrap();
            assert_eq!(config.app.log_verbosity, expected);
        }
    }

    #[test]
    fn parses_system_prompt_modes() {
        let dir = tempfile::tempdir().unwrap();

        for (value, expected) in [
            ("as_assistant", SystemPromptMode::AsAssistant),
            ("top_level", SystemPromptMode::TopLevel),
        ] {
            let config_path = dir.path().join(format!("config_{}.toml", value));
            fs::write(&config_path, format!(r#"
[anthropic]
system_prompt_mode = "{}"
"#, value)).unwrap();

            let config = Config::load_from(config_path).unwrap();
            assert_eq!(config.anthropic.system_prompt_mode, expected);
        }
    }

    #[test]
    fn driver_options_follow_config() {
        let config = Config {
            http: HttpConfig {
                request_timeout_secs: 5,
                discovery_timeout_secs: 2,
                stream_idle_timeout_secs: 9,
            },
            anthropic: AnthropicConfig {
                system_prompt_mode: SystemPromptMode::TopLevel,
                max_tokens: 2048,
            },
            ..Config::default()
        };

        let options = config.driver_options();

        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.discovery_timeout, Duration::from_secs(2));
        assert_eq!(options.stream_idle_timeout, Duration::from_secs(9));
        assert_eq!(options.system_prompt_mode, SystemPromptMode::TopLevel);
        assert_eq!(options.anthropic_max_tokens, 2048);
    }

    #[test]
    fn state_files_live_in_state_dir() {
        let storage = StorageConfig { state_dir: PathBuf::from("/var/bg") };

        assert_eq!(storage.services_path(), PathBuf::from("/var/bg/services.toml"));
        assert_eq!(storage.secrets_path(), PathBuf::from("/var/bg/secrets.json"));
        assert_eq!(storage.disabled_models_path(), PathBuf::from("/var/bg/disabled_models.json"));
    }
}
