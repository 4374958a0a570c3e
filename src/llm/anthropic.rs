//! Anthropic Messages API provider

use super::types::{ContentBlock, LlmMessage, LlmRequest, LlmResponse, MessageRole, Usage};
use super::{LlmError, LlmService};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_TOKENS: u32 = 1024;
const API_VERSION: &str = "2023-06-01";

/// Anthropic service implementation
pub struct AnthropicService {
    client: Client,
    api_key: String,
    api_model: String,
    base_url: String,
}

impl AnthropicService {
    pub fn new(api_key: String, api_model: &str, gateway: Option<&str>) -> Result<Self, LlmError> {
        let base_url = match gateway {
            Some(gw) => format!("{}/_/gateway/anthropic/v1/messages", gw.trim_end_matches('/')),
            None => "https://api.anthropic.com/v1/messages".to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            api_model: api_model.to_string(),
            base_url,
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.api_model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system.clone(),
            messages: request.messages.iter().map(translate_message).collect(),
        }
    }
}

fn translate_message(msg: &LlmMessage) -> AnthropicMessage {
    let role = match msg.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };

    let content = msg
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
            ContentBlock::Image { url } => AnthropicContentBlock::Image {
                source: AnthropicImageSource::Url { url: url.clone() },
            },
        })
        .collect();

    AnthropicMessage {
        role: role.to_string(),
        content,
    }
}

fn normalize_response(resp: AnthropicResponse) -> LlmResponse {
    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            AnthropicContentBlock::Text { text } => Some(ContentBlock::Text { text }),
            // Images never appear in replies
            AnthropicContentBlock::Image { .. } => None,
        })
        .collect();

    LlmResponse {
        content,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}

#[async_trait]
impl LlmService for AnthropicService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let anthropic_request = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(|e| LlmError::transport(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::transport(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body));
        }

        let anthropic_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::malformed(format!("Failed to parse response: {e} - body: {body}")))?;

        Ok(normalize_response(anthropic_response))
    }

    fn model_id(&self) -> &str {
        &self.api_model
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicImageSource {
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_request_maps_roles_and_images() {
        let service = AnthropicService::new("key".to_string(), "claude-test", None).unwrap();
        let request = LlmRequest {
            system: "be brief".to_string(),
            messages: vec![
                LlmMessage {
                    role: MessageRole::User,
                    content: vec![
                        ContentBlock::text("what is this?"),
                        ContentBlock::image_url("https://media.example/a.jpg"),
                    ],
                },
                LlmMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentBlock::text("a photo")],
                },
            ],
            max_tokens: None,
        };

        let json = serde_json::to_value(service.translate_request(&request)).unwrap();

        assert_eq!(json["model"], "claude-test");
        assert_eq!(json["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(json["system"], "be brief");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][1]["type"], "image");
        assert_eq!(json["messages"][0]["content"][1]["source"]["type"], "url");
        assert_eq!(json["messages"][1]["role"], "assistant");
    }

    #[test]
    fn test_gateway_base_url() {
        let service =
            AnthropicService::new("implicit".to_string(), "m", Some("http://gw.local/llm/")).unwrap();
        assert_eq!(service.base_url, "http://gw.local/llm/_/gateway/anthropic/v1/messages");
    }
}
