use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use skein_core::config::ModelConfig;
use skein_core::error::{Result, SkeinError};

use crate::presets::resolve_endpoint;

/// One message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Non-streaming OpenAI-compatible chat completion client. Works with
/// OpenAI, Ollama, Groq, OpenRouter, and anything else speaking
/// `/chat/completions`.
#[derive(Clone, Default)]
pub struct ChatClient {
    http: Client,
}

impl ChatClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub async fn complete(&self, config: &ModelConfig, messages: &[ChatTurn]) -> Result<String> {
        let endpoint = resolve_endpoint(config);
        let body = build_request(config, messages);

        let mut req = self.http.post(&endpoint).json(&body);
        if let Some(api_key) = &config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| SkeinError::LlmRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(SkeinError::LlmRequest(format!("HTTP {}: {}", status, body)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SkeinError::LlmRequest(e.to_string()))?;
        let content = parse_response(&text)?;
        debug!(model = %config.model_id, chars = content.len(), "Completion received");
        Ok(content)
    }
}

fn build_request<'a>(config: &'a ModelConfig, messages: &'a [ChatTurn]) -> ChatRequest<'a> {
    ChatRequest {
        model: &config.model_id,
        messages,
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        stream: false,
    }
}

fn parse_response(body: &str) -> Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| SkeinError::LlmRequest(format!("invalid completion response: {}", e)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| SkeinError::LlmRequest("completion response had no content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: None,
            base_url: None,
            max_tokens: 512,
            temperature: 0.0,
            retry: None,
        }
    }

    #[test]
    fn test_request_shape() {
        let config = config();
        let messages = vec![ChatTurn::system("be brief"), ChatTurn::user("hi")];
        let json = serde_json::to_value(build_request(&config, &messages)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_temperature_sent_when_set() {
        let mut config = config();
        config.temperature = 0.5;
        let json = serde_json::to_value(build_request(&config, &[])).unwrap();
        assert_eq!(json["temperature"], 0.5);
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hello!"}}]}"#;
        assert_eq!(parse_response(body).unwrap(), "Hello!");

        assert!(parse_response(r#"{"choices":[]}"#).is_err());
        assert!(parse_response(r#"{"choices":[{"message":{"content":null}}]}"#).is_err());
        assert!(parse_response("not json").is_err());
    }
}
