//! LLM provider and model-role configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ConfigError, ConfigSeverity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Model role (planner/executor/summarizer/embedder) → resolution config.
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn d_timeout_ms() -> u64 {
    20_000
}
fn d_max_retries() -> u32 {
    2
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: d_timeout_ms(),
            max_retries: d_max_retries(),
            roles: HashMap::new(),
            providers: Vec::new(),
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut ids = std::collections::HashSet::new();

        for p in &self.providers {
            if p.id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "llm.providers[].id".into(),
                    message: "provider id must not be empty".into(),
                });
            }
            if !ids.insert(p.id.clone()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "llm.providers[].id".into(),
                    message: format!("duplicate provider id: {}", p.id),
                });
            }
            errors.extend(p.auth.validate(&p.id));
        }

        for (role, cfg) in &self.roles {
            if !self.providers.iter().any(|p| {
                cfg.model
                    .split('/')
                    .next()
                    .map(|prefix| prefix == p.id)
                    .unwrap_or(false)
            }) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.roles.{role}.model"),
                    message: format!(
                        "model '{}' does not reference a configured provider id",
                        cfg.model
                    ),
                });
            }
        }

        if self.providers.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no providers configured; the executor will fail on its first LLM call".into(),
            });
        }

        errors
    }
}

/// Resolution config for one model role (e.g. "planner").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// `provider_id/model_name`.
    pub model: String,
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default)]
    pub require_json: bool,
    #[serde(default)]
    pub fallbacks: Vec<FallbackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub model: String,
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default)]
    pub require_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
}

impl AuthConfig {
    fn validate(&self, provider_id: &str) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.mode == AuthMode::ApiKey
            && self.env.is_none()
            && self.key.is_none()
            && (self.service.is_none() || self.account.is_none())
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: format!("llm.providers[{provider_id}].auth"),
                message: "api_key mode requires env, key, or service+account".into(),
            });
        }
        if self.key.is_some() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: format!("llm.providers[{provider_id}].auth.key"),
                message: "plaintext key in config; prefer env or keychain".into(),
            });
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    ApiKey,
    Keychain,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> LlmConfig {
        let mut cfg = LlmConfig::default();
        cfg.providers.push(ProviderConfig {
            id: "openai".into(),
            kind: ProviderKind::OpenaiCompat,
            base_url: "https://api.openai.com/v1".into(),
            auth: AuthConfig {
                env: Some("OPENAI_API_KEY".into()),
                ..Default::default()
            },
            default_model: Some("gpt-4o".into()),
        });
        cfg.roles.insert(
            "planner".into(),
            RoleConfig {
                model: "openai/gpt-4o".into(),
                require_tools: false,
                require_json: true,
                fallbacks: vec![],
            },
        );
        cfg
    }

    #[test]
    fn valid_config_has_no_errors() {
        assert!(valid_config().validate().is_empty());
    }

    #[test]
    fn empty_provider_id_is_an_error() {
        let mut cfg = valid_config();
        cfg.providers[0].id = String::new();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn duplicate_provider_ids_rejected() {
        let mut cfg = valid_config();
        let dup = cfg.providers[0].clone();
        cfg.providers.push(dup);
        assert!(cfg.validate().iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn api_key_mode_without_any_source_is_an_error() {
        let mut cfg = valid_config();
        cfg.providers[0].auth = AuthConfig::default();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn role_referencing_unknown_provider_is_a_warning() {
        let mut cfg = valid_config();
        cfg.roles.insert(
            "executor".into(),
            RoleConfig {
                model: "ghost/gpt-x".into(),
                require_tools: false,
                require_json: false,
                fallbacks: vec![],
            },
        );
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field.contains("executor") && e.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn no_providers_is_a_warning() {
        let cfg = LlmConfig::default();
        assert!(cfg.validate().iter().any(|e| e.field == "llm.providers"));
    }
}
