//! Daemon configuration.
//!
//! Settings load from a TOML file and are overridden by environment
//! variables of the form `AGENTGW_<SECTION>__<KEY>` (double underscore
//! separates the section from the key): `AGENTGW_SERVER__PORT=9090`,
//! `AGENTGW_LLM__PROVIDER=anthropic`. The flat `AGENTGW_API_KEY` variable
//! sets the HTTP bearer key, and provider API keys come from the usual flat
//! variables (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `XAI_API_KEY`) unless
//! set in the file. Configuration is immutable after load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use agentgw_agent::{ProviderConfig, ProviderKind};

use crate::error::{Result, ServiceError};
use crate::scheduler::JobConfig;
use crate::webhook::WebhookSubscription;

/// Env var prefix for overrides.
const ENV_PREFIX: &str = "AGENTGW_";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub orchestration: OrchestrationConfig,
    pub jobs: Vec<JobConfig>,
    pub webhooks: Vec<WebhookSubscription>,
}

/// HTTP façade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, `/api/*` requires `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            api_key: None,
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `openai`, `anthropic`, or `xai`.
    pub provider: String,
    /// Default model; empty picks the provider's conventional default.
    pub model: String,
    /// API key; falls back to the provider's flat env variable.
    pub api_key: Option<String>,
    /// Endpoint override for compatible servers.
    pub base_url: Option<String>,
    /// Default per-turn token cap.
    pub max_tokens: u32,
    /// Probe the provider at startup and refuse to start when unreachable.
    pub startup_probe: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: String::new(),
            api_key: None,
            base_url: None,
            max_tokens: 4096,
            startup_probe: false,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. The literal `:memory:` keeps everything
    /// in-process.
    pub db_path: PathBuf,
    /// Directory of skill TOML files.
    pub skills_dir: PathBuf,
    /// Directory receiving scheduled-job logs.
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("agentgw.db"),
            skills_dir: PathBuf::from("skills"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Embedding backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (hashing embedder) or `openai`.
    pub provider: String,
    /// Model for the remote embedder.
    pub model: String,
    /// API key; falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            model: "text-embedding-3-small".into(),
            api_key: None,
        }
    }
}

/// Delegation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Maximum orchestration depth a delegation chain may reach.
    pub max_depth: u32,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self { max_depth: 2 }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration: the TOML file (when present) overlaid with
    /// `AGENTGW_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut value = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|e| ServiceError::Config {
                    reason: format!("cannot read {}: {e}", path.display()),
                })?;
                content
                    .parse::<toml::Value>()
                    .map_err(|e| ServiceError::Config {
                        reason: format!("cannot parse {}: {e}", path.display()),
                    })?
            }
            _ => toml::Value::Table(Default::default()),
        };

        apply_env_overrides(&mut value, std::env::vars());

        value.try_into().map_err(|e| ServiceError::Config {
            reason: format!("invalid configuration: {e}"),
        })
    }

    /// Resolve the provider settings, pulling the API key from the
    /// environment when the file does not carry one.
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let kind = ProviderKind::parse(&self.llm.provider)
            .map_err(|e| ServiceError::Config {
                reason: e.to_string(),
            })?;

        let api_key = self
            .llm
            .api_key
            .clone()
            .or_else(|| std::env::var(kind.api_key_env()).ok())
            .unwrap_or_default();

        let model = if self.llm.model.is_empty() {
            default_model(kind).to_string()
        } else {
            self.llm.model.clone()
        };

        Ok(ProviderConfig {
            kind,
            api_key,
            base_url: self.llm.base_url.clone(),
            model,
            max_tokens: self.llm.max_tokens,
        })
    }
}

/// Conventional default model per provider family.
fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "gpt-4o-mini",
        ProviderKind::Anthropic => "claude-sonnet-4-20250514",
        ProviderKind::Xai => "grok-3-mini",
    }
}

/// Overlay `AGENTGW_*` variables onto the parsed TOML value.
///
/// `AGENTGW_<SECTION>__<KEY>` sets `[section] key`; values are parsed as
/// bool, integer, or float when they look like one, string otherwise.
/// `AGENTGW_API_KEY` (no section) maps to `server.api_key`. Array sections
/// (jobs, webhooks) are file-only.
fn apply_env_overrides(value: &mut toml::Value, vars: impl Iterator<Item = (String, String)>) {
    let Some(table) = value.as_table_mut() else {
        return;
    };

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };

        let (section, field) = match rest.split_once("__") {
            Some((section, field)) if !section.is_empty() && !field.is_empty() => {
                (section.to_lowercase(), field.to_lowercase())
            }
            _ if rest == "API_KEY" => ("server".to_string(), "api_key".to_string()),
            _ => continue,
        };

        debug!(section = %section, field = %field, "applying env override");

        let entry = table
            .entry(section)
            .or_insert_with(|| toml::Value::Table(Default::default()));
        if let Some(section_table) = entry.as_table_mut() {
            section_table.insert(field, parse_scalar(&raw));
        }
    }
}

/// Best-effort scalar typing for env override values.
fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.orchestration.max_depth, 2);
        assert!(config.jobs.is_empty());
        assert!(config.webhooks.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgw.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"
            [server]
            host = "0.0.0.0"
            port = 9001
            api_key = "hunter2"

            [llm]
            provider = "openai"
            model = "gpt-test"
            max_tokens = 2048
            startup_probe = true

            [storage]
            db_path = "/tmp/gw.db"

            [orchestration]
            max_depth = 4

            [[jobs]]
            name = "digest"
            skill = "reporter"
            message = "write the daily digest"
            cron = "0 7 * * *"
            log_output = true

            [[webhooks]]
            name = "ops"
            url = "http://localhost:9999/hook"
            events = ["agent.completed", "agent.failed"]
            secret = "shh"
            "#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.api_key.as_deref(), Some("hunter2"));
        assert_eq!(config.llm.provider, "openai");
        assert!(config.llm.startup_probe);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/gw.db"));
        assert_eq!(config.orchestration.max_depth, 4);
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].name, "digest");
        assert!(config.jobs[0].enabled);
        assert_eq!(config.webhooks.len(), 1);
        assert_eq!(config.webhooks[0].events.len(), 2);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/agentgw.toml"))).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn env_overrides_sections_with_typing() {
        let mut value = toml::Value::Table(Default::default());
        apply_env_overrides(
            &mut value,
            vec![
                ("AGENTGW_SERVER__PORT".to_string(), "9090".to_string()),
                ("AGENTGW_LLM__PROVIDER".to_string(), "xai".to_string()),
                ("AGENTGW_LLM__STARTUP_PROBE".to_string(), "true".to_string()),
                ("AGENTGW_API_KEY".to_string(), "sekrit".to_string()),
                ("UNRELATED_VAR".to_string(), "ignored".to_string()),
            ]
            .into_iter(),
        );

        let config: Config = value.try_into().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.llm.provider, "xai");
        assert!(config.llm.startup_probe);
        assert_eq!(config.server.api_key.as_deref(), Some("sekrit"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut value: toml::Value = "[server]\nport = 8080\n".parse().unwrap();
        apply_env_overrides(
            &mut value,
            vec![("AGENTGW_SERVER__PORT".to_string(), "1234".to_string())].into_iter(),
        );
        let config: Config = value.try_into().unwrap();
        assert_eq!(config.server.port, 1234);
    }

    #[test]
    fn provider_config_picks_defaults_per_kind() {
        let mut config = Config::default();
        config.llm.provider = "openai".into();
        config.llm.api_key = Some("k".into());

        let pc = config.provider_config().unwrap();
        assert_eq!(pc.kind, ProviderKind::OpenAi);
        assert_eq!(pc.model, "gpt-4o-mini");

        config.llm.model = "custom".into();
        assert_eq!(config.provider_config().unwrap().model, "custom");

        config.llm.provider = "nope".into();
        assert!(config.provider_config().is_err());
    }

    #[test]
    fn scalar_parsing() {
        assert_eq!(parse_scalar("true"), toml::Value::Boolean(true));
        assert_eq!(parse_scalar("42"), toml::Value::Integer(42));
        assert_eq!(parse_scalar("0.5"), toml::Value::Float(0.5));
        assert_eq!(
            parse_scalar("hello"),
            toml::Value::String("hello".to_string())
        );
    }
}
