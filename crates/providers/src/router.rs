//! Capability-driven LLM router.
//!
//! The router selects providers and models based on role requirements
//! (tools, JSON mode) and falls back through an ordered list of
//! role-specific alternates when the primary model fails with a retryable
//! error.

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use ag_domain::capability::{LlmCapabilities, ModelRole, ToolSupport};
use ag_domain::config::{LlmConfig, RoleConfig};
use ag_domain::trace::TraceEvent;
use ag_domain::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A capability-driven router that selects providers per role and handles
/// fallback on transient failures.
pub struct LlmRouter {
    registry: ProviderRegistry,
    role_configs: HashMap<String, RoleConfig>,
    default_timeout_ms: u64,
}

impl LlmRouter {
    pub fn from_config(llm_config: &LlmConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(llm_config)?;
        let role_configs = llm_config.roles.clone();
        Ok(Self {
            registry,
            role_configs,
            default_timeout_ms: llm_config.default_timeout_ms,
        })
    }

    /// Build from an already-constructed registry (useful for testing).
    pub fn new(
        registry: ProviderRegistry,
        role_configs: HashMap<String, RoleConfig>,
        default_timeout_ms: u64,
    ) -> Self {
        Self { registry, role_configs, default_timeout_ms }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Send a chat request for a given model role.
    ///
    /// 1. Resolves the primary model from the role config.
    /// 2. Validates the provider satisfies the required capabilities.
    /// 3. Sends the request.
    /// 4. On a retryable failure, falls back to the next configured model.
    /// 5. Emits `TraceEvent::LlmRequest` / `TraceEvent::LlmFallback`.
    pub async fn chat_for_role(&self, role: ModelRole, mut req: ChatRequest) -> Result<ChatResponse> {
        let role_str = role_to_string(role);
        let role_cfg = self
            .role_configs
            .get(&role_str)
            .ok_or_else(|| Error::Config(format!("no role config for '{role_str}'")))?;

        let (provider_id, model_name) = resolve_model(&role_cfg.model);
        if let Some(provider) = self.registry.get(provider_id) {
            if Self::check_capabilities(provider.capabilities(), role_cfg) {
                req.model = Some(model_name.to_string());
                let start = Instant::now();
                let result = self.try_chat(&provider, req.clone()).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                match &result {
                    Ok(_) => {
                        TraceEvent::LlmRequest {
                            role: role_str.clone(),
                            provider: provider_id.to_string(),
                            model: model_name.to_string(),
                            duration_ms,
                        }
                        .emit();
                        return result;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(provider = %provider_id, model = %model_name, error = %e, "primary model failed, trying fallbacks");
                    }
                    Err(_) => return result,
                }
            } else {
                tracing::warn!(provider = %provider_id, model = %model_name, "primary model does not satisfy required capabilities, trying fallbacks");
            }
        } else {
            tracing::warn!(provider = %provider_id, "primary provider not found in registry, trying fallbacks");
        }

        for fallback in &role_cfg.fallbacks {
            let (fb_provider_id, fb_model_name) = resolve_model(&fallback.model);
            let Some(fb_provider) = self.registry.get(fb_provider_id) else {
                tracing::warn!(provider = %fb_provider_id, "fallback provider not found, skipping");
                continue;
            };

            let cap = fb_provider.capabilities();
            if fallback.require_tools && cap.supports_tools == ToolSupport::None {
                continue;
            }
            if fallback.require_json && !cap.supports_json_mode {
                continue;
            }

            TraceEvent::LlmFallback {
                role: role_str.clone(),
                from_provider: provider_id.to_string(),
                to_provider: fb_provider_id.to_string(),
                reason: "primary model failed or unavailable".into(),
            }
            .emit();

            req.model = Some(fb_model_name.to_string());
            let start = Instant::now();
            let result = self.try_chat(&fb_provider, req.clone()).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => {
                    TraceEvent::LlmRequest {
                        role: role_str.clone(),
                        provider: fb_provider_id.to_string(),
                        model: fb_model_name.to_string(),
                        duration_ms,
                    }
                    .emit();
                    return result;
                }
                Err(e) if e.is_retryable() => continue,
                Err(_) => return result,
            }
        }

        Err(Error::Provider {
            provider: "router".into(),
            message: format!("all models for role '{role_str}' failed or were unavailable"),
        })
    }

    async fn try_chat(&self, provider: &Arc<dyn LlmProvider>, req: ChatRequest) -> Result<ChatResponse> {
        let timeout = std::time::Duration::from_millis(self.default_timeout_ms);
        match tokio::time::timeout(timeout, provider.complete(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    fn check_capabilities(cap: &LlmCapabilities, role_cfg: &RoleConfig) -> bool {
        if role_cfg.require_tools && cap.supports_tools == ToolSupport::None {
            return false;
        }
        if role_cfg.require_json && !cap.supports_json_mode {
            return false;
        }
        true
    }
}

/// Split a `"provider_id/model_name"` string into its two components.
pub fn resolve_model(model_str: &str) -> (&str, &str) {
    match model_str.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (model_str, ""),
    }
}

fn role_to_string(role: ModelRole) -> String {
    match role {
        ModelRole::Planner => "planner".to_string(),
        ModelRole::Executor => "executor".to_string(),
        ModelRole::Summarizer => "summarizer".to_string(),
        ModelRole::Embedder => "embedder".to_string(),
    }
}
