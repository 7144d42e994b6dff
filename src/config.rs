//! Configuration
//!
//! One TOML file with a section per component. Every field has a default,
//! so an empty file (or none at all) is a valid configuration.
//! `TOOLSMITH_*` environment variables override the file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::codegen::GeneratorSettings;
use crate::supervisor::SupervisorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub registry: RegistryConfig,
    pub codegen: CodegenConfig,
    pub agent: AgentSection,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
    pub secrets: SecretsConfig,
}

/// Where per-unit host services listen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// 0 asks the OS for an ephemeral port
    pub port_base: u16,
    pub port_range: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = SupervisorSettings::default();
        Self {
            host: defaults.host,
            port_base: defaults.port_base,
            port_range: defaults.port_range,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Parent of every unit directory
    pub units_dir: PathBuf,
    /// Path of the guest SDK crate generated units depend on
    pub sdk_path: PathBuf,
    /// Shared Cargo target dir for unit builds
    pub target_dir: Option<PathBuf>,
    pub handshake_timeout_ms: u64,
    pub handshake_poll_ms: u64,
    pub exit_timeout_ms: u64,
    pub call_timeout_ms: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            units_dir: PathBuf::from("units"),
            sdk_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            target_dir: None,
            handshake_timeout_ms: 1_000,
            handshake_poll_ms: 10,
            exit_timeout_ms: 2_000,
            call_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Jobs running longer than this are promoted to "shown"
    pub slow_threshold_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 1_000,
            flush_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// Falls back to `llm.default_model` when empty
    pub model: String,
    pub max_attempts: u32,
    pub max_total_tokens: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        let defaults = GeneratorSettings::default();
        Self {
            model: defaults.model,
            max_attempts: defaults.max_attempts,
            max_total_tokens: defaults.max_total_tokens,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Falls back to `llm.default_model` when empty
    pub model: String,
    pub max_iterations: usize,
    pub max_total_tokens: Option<u64>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Defaults to `~/.toolsmith/sessions`
    pub sessions_dir: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            model: String::new(),
            max_iterations: defaults.max_iterations,
            max_total_tokens: defaults.max_total_tokens,
            system_prompt: defaults.system_prompt,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            sessions_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    /// No completion service; generation and agent runs are unavailable
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub base_url: String,
    pub default_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            base_url: "http://localhost:11434".to_string(),
            default_model: "qwen3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
    /// OTLP collector; spans are exported only when set
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,toolsmith=debug".to_string(),
            format: LogFormat::Pretty,
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// TOML file of `alias = "value"` pairs
    pub file: Option<PathBuf>,
    /// Reload period; 0 disables reloading
    pub refresh_secs: u64,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: None,
            refresh_secs: 30,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (or defaults), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOOLSMITH_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TOOLSMITH_UNITS_DIR") {
            self.supervisor.units_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLSMITH_SDK_PATH") {
            self.supervisor.sdk_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLSMITH_LLM_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("TOOLSMITH_MODEL") {
            self.llm.default_model = v;
        }
        if let Some(v) = lookup("TOOLSMITH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("TOOLSMITH_OTLP_ENDPOINT") {
            self.logging.otlp_endpoint = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("TOOLSMITH_SECRETS_FILE") {
            self.secrets.file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TOOLSMITH_MAX_ATTEMPTS") {
            self.codegen.max_attempts = parse_env("TOOLSMITH_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TOOLSMITH_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("TOOLSMITH_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("TOOLSMITH_PORT_BASE") {
            self.server.port_base = parse_env("TOOLSMITH_PORT_BASE", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.codegen.max_attempts == 0 {
            return Err(invalid("codegen.max_attempts", "must be at least 1"));
        }
        if self.agent.max_iterations == 0 {
            return Err(invalid("agent.max_iterations", "must be at least 1"));
        }
        if self.server.port_base != 0 && self.server.port_range == 0 {
            return Err(invalid("server.port_range", "must be at least 1 when port_base is set"));
        }
        if self.supervisor.handshake_timeout_ms == 0 {
            return Err(invalid("supervisor.handshake_timeout_ms", "must be positive"));
        }
        if self.supervisor.handshake_poll_ms == 0 {
            return Err(invalid("supervisor.handshake_poll_ms", "must be positive"));
        }
        if self.registry.flush_interval_ms == 0 {
            return Err(invalid("registry.flush_interval_ms", "must be positive"));
        }
        if self.llm.provider == LlmProvider::Ollama && !self.llm.base_url.starts_with("http") {
            return Err(invalid("llm.base_url", "must be an http(s) URL"));
        }
        if self.llm.default_model.is_empty() {
            return Err(invalid("llm.default_model", "must not be empty"));
        }
        Ok(())
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            host: self.server.host,
            port_base: self.server.port_base,
            port_range: self.server.port_range,
            handshake_timeout: Duration::from_millis(self.supervisor.handshake_timeout_ms),
            handshake_poll: Duration::from_millis(self.supervisor.handshake_poll_ms),
            exit_timeout: Duration::from_millis(self.supervisor.exit_timeout_ms),
            call_timeout: self.supervisor.call_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn generator_settings(&self) -> GeneratorSettings {
        GeneratorSettings {
            model: or_default(&self.codegen.model, &self.llm.default_model),
            max_attempts: self.codegen.max_attempts,
            max_total_tokens: self.codegen.max_total_tokens,
            temperature: self.codegen.temperature,
            max_tokens: self.codegen.max_tokens,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: or_default(&self.agent.model, &self.llm.default_model),
            max_iterations: self.agent.max_iterations,
            max_total_tokens: self.agent.max_total_tokens,
            system_prompt: self.agent.system_prompt.clone(),
            temperature: self.agent.temperature,
            max_tokens: self.agent.max_tokens,
        }
    }
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() { fallback } else { value }.to_string()
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.codegen.max_attempts, 10);
        assert_eq!(config.supervisor_settings().handshake_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolsmith.toml");
        std::fs::write(
            &path,
            r#"
[codegen]
max_attempts = 3
max_total_tokens = 50000

[llm]
default_model = "llama3.2"

[logging]
format = "json"
"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.codegen.max_attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.generator_settings().model, "llama3.2");
        assert_eq!(config.generator_settings().max_total_tokens, Some(50_000));
        assert_eq!(config.agent.max_iterations, 10);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[codegen\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TOOLSMITH_MODEL", "mistral"),
            ("TOOLSMITH_MAX_ITERATIONS", "4"),
            ("TOOLSMITH_OTLP_ENDPOINT", "http://collector:4317"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.agent_config().model, "mistral");
        assert_eq!(config.agent_config().max_iterations, 4);
        assert_eq!(config.logging.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "TOOLSMITH_MAX_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "TOOLSMITH_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.codegen.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.llm.base_url = "localhost:11434".into();
        assert!(config.validate().is_err());
        config.llm.provider = LlmProvider::None;
        assert!(config.validate().is_ok());
    }
}
