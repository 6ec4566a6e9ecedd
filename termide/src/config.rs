use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::OpenAiBackend;
use crate::rate_limit::RateLimitConfig;
use crate::registry::BASE_AGENT;
use crate::tools::ProjectTools;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no home directory")]
    NoHome,
}

fn default_model() -> String {
    crate::backend::DEFAULT_MODEL.to_string()
}

fn default_base_url() -> String {
    crate::backend::DEFAULT_BASE_URL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_stream_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_fallback_agent() -> String {
    BASE_AGENT.to_string()
}

/// Persistent settings at `~/.termide/config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// Agent looked up by the last step of the fallback chain.
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: String,
    /// Offer the read-only project tools to the model.
    #[serde(default = "default_true")]
    pub tools: bool,
    /// Defaults to `~/.termide/logs/trace.log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
    /// Supplied by flag or environment only. Never written to disk.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            organization: None,
            temperature: default_temperature(),
            max_tokens: None,
            rate_limit: RateLimitConfig::default(),
            stream_timeout_secs: default_stream_timeout_secs(),
            fallback_agent: default_fallback_agent(),
            tools: true,
            trace_log: None,
            api_key: None,
        }
    }
}

impl Config {
    /// `~/.termide`
    pub fn home_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".termide"))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::home_dir().map(|d| d.join("config.json"))
    }

    /// Load from `~/.termide/config.json`. Missing or unreadable files give defaults.
    pub fn load() -> Self {
        Self::config_path()
            .map(|p| Self::load_from(&p))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring invalid config: {e}");
                Self::default()
            }
        }
    }

    /// Save to `~/.termide/config.json` (mode 0o600).
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn trace_log_path(&self) -> Option<PathBuf> {
        self.trace_log
            .clone()
            .or_else(crate::trace::default_trace_path)
    }

    /// HTTP backend built from these settings. Tools, when enabled, are confined
    /// to `project_root`.
    pub fn openai_backend(&self, project_root: &Path) -> OpenAiBackend {
        let backend = OpenAiBackend::new(self.api_key.clone())
            .with_base_url(&self.base_url)
            .with_organization(self.organization.clone())
            .with_default_model(&self.model)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        if self.tools {
            backend.with_tools(Arc::new(ProjectTools::new(project_root)))
        } else {
            backend
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_object_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.stream_timeout(), Duration::from_secs(120));
        assert_eq!(config.fallback_agent, "assistant");
        assert_eq!(config.rate_limit.max_requests, 50);
        assert!(config.tools);
    }

    #[test]
    fn save_never_writes_api_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            api_key: Some("sk-secret".into()),
            model: "gpt-4o-mini".into(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-secret"));
        let loaded = Config::load_from(&path);
        assert_eq!(loaded.model, "gpt-4o-mini");
        assert_eq!(loaded.api_key, None);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save_to(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_or_invalid_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Config::load_from(&dir.path().join("none.json")), Config::default());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert_eq!(Config::load_from(&bad), Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"rate_limit": {"max_requests": 5}, "max_tokens": 512}"#).unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.time_window_secs, 60);
        assert_eq!(config.max_tokens, Some(512));
        assert_eq!(config.model, "gpt-4o");
    }

    #[test]
    fn tools_flag_controls_backend_tools() {
        let dir = TempDir::new().unwrap();
        let with_tools = Config::default().openai_backend(dir.path());
        assert_eq!(with_tools.tool_definitions().len(), 4);

        let config: Config = serde_json::from_str(r#"{"tools": false}"#).unwrap();
        assert!(config.openai_backend(dir.path()).tool_definitions().is_empty());
    }
}
