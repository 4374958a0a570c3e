//! Completion service configuration

use super::{AnthropicService, LlmService, LoggingService};
use std::sync::Arc;

const DEFAULT_API_MODEL: &str = "claude-3-5-haiku-20241022";

/// Configuration for the completion provider
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    /// Gateway URL; when set, the gateway handles authentication
    pub gateway: Option<String>,
    /// Provider model name
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            model: std::env::var("INTAKE_MODEL").ok(),
        }
    }
}

/// Build the logging-wrapped completion service, or None if nothing is
/// configured.
pub fn build_service(config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
    let api_key = if config.gateway.is_some() {
        "implicit".to_string()
    } else {
        config.anthropic_api_key.clone().filter(|k| !k.is_empty())?
    };
    let model = config.model.as_deref().unwrap_or(DEFAULT_API_MODEL);

    match AnthropicService::new(api_key, model, config.gateway.as_deref()) {
        Ok(service) => Some(Arc::new(LoggingService::new(Arc::new(service)))),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create completion service");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_api_keys_no_service() {
        assert!(build_service(&LlmConfig::default()).is_none());
    }

    #[test]
    fn test_empty_key_is_ignored() {
        let config = LlmConfig {
            anthropic_api_key: Some(String::new()),
            ..Default::default()
        };
        assert!(build_service(&config).is_none());
    }

    #[test]
    fn test_gateway_needs_no_key() {
        let config = LlmConfig {
            gateway: Some("http://169.254.169.254/gateway/llm".to_string()),
            model: Some("claude-custom".to_string()),
            ..Default::default()
        };
        let service = build_service(&config).unwrap();
        assert_eq!(service.model_id(), "claude-custom");
    }
}
