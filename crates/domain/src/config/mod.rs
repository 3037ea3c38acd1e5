//! Layered, validated startup configuration.
//!
//! Every tunable the engine reads — thresholds, timeouts, provider/role
//! wiring — flows through this `Config` and nowhere else; no component
//! above this crate reads the process environment directly except for
//! credential resolution inside `ag-providers`.

pub mod llm;

pub use llm::{AuthConfig, AuthMode, FallbackConfig, LlmConfig, ProviderConfig, ProviderKind, RoleConfig};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.executor.validate());
        errors.extend(self.llm.validate());
        errors
    }
}

/// The six tunables spec §6 names as the engine's recognized configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "d_max_messages")]
    pub max_messages: usize,
    #[serde(default = "d_summary_threshold")]
    pub summary_threshold: usize,
    #[serde(default = "d_max_steps")]
    pub max_steps: usize,
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "d_tool_timeout_sec")]
    pub tool_timeout_sec: u64,
    #[serde(default = "d_llm_timeout_sec")]
    pub llm_timeout_sec: u64,
}

fn d_max_messages() -> usize {
    50
}
fn d_summary_threshold() -> usize {
    40
}
fn d_max_steps() -> usize {
    40
}
fn d_max_attempts() -> u32 {
    3
}
fn d_tool_timeout_sec() -> u64 {
    60
}
fn d_llm_timeout_sec() -> u64 {
    60
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_messages: d_max_messages(),
            summary_threshold: d_summary_threshold(),
            max_steps: d_max_steps(),
            max_attempts: d_max_attempts(),
            tool_timeout_sec: d_tool_timeout_sec(),
            llm_timeout_sec: d_llm_timeout_sec(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.summary_threshold >= self.max_messages {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "executor.summary_threshold".into(),
                message: "must be less than max_messages".into(),
            });
        }
        if self.max_steps == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "executor.max_steps".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.max_attempts == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "executor.max_attempts".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.tool_timeout_sec == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "executor.tool_timeout_sec".into(),
                message: "zero effectively disables tool timeouts".into(),
            });
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
