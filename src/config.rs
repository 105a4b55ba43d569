//! Server configuration
//!
//! Loaded from a YAML file, then overridden by `BRANCHCHAT_*` environment
//! variables and finally by command-line flags. `validate()` runs last.

use crate::llm::{ModelInfo, ProviderKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/branchchat.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL clients use to reach this server; signed file links start with it.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/branchchat.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: i64,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/attachments")
}

fn default_url_ttl_secs() -> i64 {
    24 * 60 * 60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            signing_secret: String::new(),
            url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

/// One LLM endpoint. Model ids are addressed as `{name}/{model}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default = "default_requires_key")]
    pub requires_key: bool,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

fn default_requires_key() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

fn model(id: &str, name: &str) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        name: name.to_string(),
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "openai".to_string(),
            kind: ProviderKind::Openai,
            base_url: "https://api.openai.com/v1".to_string(),
            requires_key: true,
            models: vec![
                model("gpt-4o", "GPT-4o"),
                model("gpt-4o-mini", "GPT-4o Mini"),
                model("gpt-4.1", "GPT-4.1"),
            ],
        },
        ProviderConfig {
            name: "anthropic".to_string(),
            kind: ProviderKind::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            requires_key: true,
            models: vec![
                model("claude-sonnet-4-20250514", "Claude Sonnet 4"),
                model("claude-3-5-haiku-20241022", "Claude Haiku 3.5"),
            ],
        },
        ProviderConfig {
            name: "ollama".to_string(),
            kind: ProviderKind::Ollama,
            base_url: "http://localhost:11434/v1".to_string(),
            requires_key: false,
            models: vec![model("llama3", "Llama 3"), model("qwen2.5", "Qwen 2.5")],
        },
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            uploads: UploadConfig::default(),
            providers: default_providers(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path` and apply environment overrides.
    /// A missing file falls back to defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };
        config.apply_env_vars();
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(bind) = std::env::var("BRANCHCHAT_BIND") {
            self.server.bind = bind;
        }
        if let Ok(url) = std::env::var("BRANCHCHAT_PUBLIC_URL") {
            self.server.public_url = url;
        }
        if let Ok(origins) = std::env::var("BRANCHCHAT_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Ok(path) = std::env::var("BRANCHCHAT_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("BRANCHCHAT_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(secret) = std::env::var("BRANCHCHAT_SIGNING_SECRET") {
            self.storage.signing_secret = secret;
        }
        if let Ok(ttl) = std::env::var("BRANCHCHAT_URL_TTL_SECS") {
            match ttl.parse() {
                Ok(value) => self.storage.url_ttl_secs = value,
                Err(_) => tracing::warn!("Invalid BRANCHCHAT_URL_TTL_SECS: {}", ttl),
            }
        }
        if let Ok(max) = std::env::var("BRANCHCHAT_UPLOAD_MAX_BYTES") {
            match max.parse() {
                Ok(value) => self.uploads.max_bytes = value,
                Err(_) => tracing::warn!("Invalid BRANCHCHAT_UPLOAD_MAX_BYTES: {}", max),
            }
        }
        if let Ok(json) = std::env::var("BRANCHCHAT_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        // Per-provider base URL, e.g. BRANCHCHAT_OLLAMA_BASE_URL.
        for provider in &mut self.providers {
            let key = format!(
                "BRANCHCHAT_{}_BASE_URL",
                provider.name.to_uppercase().replace('-', "_")
            );
            if let Ok(url) = std::env::var(&key) {
                provider.base_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.is_empty() {
            return Err(ConfigError::Invalid("server.bind cannot be empty".into()));
        }
        if self.storage.signing_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "storage.signing_secret must be at least 16 characters".into(),
            ));
        }
        if self.storage.url_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "storage.url_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.uploads.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "uploads.max_bytes must be greater than 0".into(),
            ));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one provider must be configured".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() || provider.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid provider name: {:?}",
                    provider.name
                )));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            if provider.base_url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider {} has no base_url",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Flattened model catalog served by `GET /api/models`.
    pub fn models(&self) -> Vec<ModelInfo> {
        self.providers
            .iter()
            .flat_map(|p| {
                p.models.iter().map(move |m| ModelInfo {
                    id: format!("{}/{}", p.name, m.id),
                    name: m.name.clone(),
                    provider: p.name.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.storage.signing_secret = "0123456789abcdef".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.uploads.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.storage.url_ttl_secs, 86_400);
        assert!(!config.provider("ollama").unwrap().requires_key);
        assert!(config.provider("openai").unwrap().requires_key);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  bind: 0.0.0.0:8080
storage:
  signing_secret: a-very-long-signing-secret
providers:
  - name: local
    kind: ollama
    base_url: http://127.0.0.1:11434/v1
    requires_key: false
    models:
      - id: llama3
        name: Llama 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.public_url, "http://localhost:3000");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::Ollama);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        valid().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        let mut config = valid();
        let first = config.providers[0].clone();
        config.providers.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_models_are_prefixed_with_provider() {
        let models = Config::default().models();
        assert!(models.iter().any(|m| m.id == "openai/gpt-4o" && m.provider == "openai"));
        assert!(models.iter().any(|m| m.id == "ollama/llama3"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/branchchat.yaml").unwrap();
        assert!(!config.providers.is_empty());
    }
}
