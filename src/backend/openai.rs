//! OpenAI-compatible chat completions adapter.
//!
//! Serves every platform that speaks the `/chat/completions` protocol
//! (openai, qwen compatible mode, deepseek, siliconflow).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{
    BackendSpec, ChatMessage, CompletionRequest, CompletionResponse, ModelBackend, pricing, tokens,
};
use crate::errors::BackendError;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Client for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: u32,
}

impl OpenAiBackend {
    pub fn new(spec: &BackendSpec) -> Result<Self, BackendError> {
        let api_key = spec.api_key.clone().ok_or_else(|| {
            BackendError::Configuration(format!(
                "No API key for platform '{}' (set {}_API_KEY or OPENAI_API_KEY)",
                spec.vendor,
                spec.vendor.to_uppercase()
            ))
        })?;

        Ok(Self {
            client: Client::new(),
            base_url: spec.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: spec.model.clone(),
            context_window: spec.context_window,
        })
    }

    pub(crate) fn construct(spec: &BackendSpec) -> Result<Arc<dyn ModelBackend>, BackendError> {
        Ok(Arc::new(Self::new(spec)?))
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn run(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let estimated_prompt = tokens::estimate_prompt_tokens(&request.messages);
        let max_tokens = request
            .max_tokens
            .unwrap_or_else(|| self.context_window.saturating_sub(estimated_prompt));

        debug!(
            "Creating chat completion with {} messages, model {}, max_tokens {}",
            request.messages.len(),
            self.model,
            max_tokens
        );

        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            error!("Chat completion failed with status {}: {}", status, text);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::UpstreamProtocol(format!("invalid completion body: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::UpstreamProtocol("response has no choices".to_string()))?;

        let content = choice.message.content.ok_or_else(|| {
            BackendError::UpstreamProtocol("first choice has no message content".to_string())
        })?;

        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => {
                warn!("Response carries no usage block, using local estimates");
                let completion = tokens::count_text(&content).unwrap_or(0);
                (estimated_prompt, u32::try_from(completion).unwrap_or(u32::MAX))
            }
        };

        pricing::log_usage(&self.model, prompt_tokens, completion_tokens);

        Ok(CompletionResponse {
            content,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(base_url: &str) -> BackendSpec {
        BackendSpec {
            vendor: "openai".into(),
            api_style: "openai".into(),
            model: "gpt-4".into(),
            base_url: base_url.into(),
            context_window: 8192,
            api_key: Some("sk-test".into()),
        }
    }

    #[tokio::test]
    async fn test_run_maps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello <INFO> done"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(&spec(&server.uri())).unwrap();
        let response = backend
            .run(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();

        assert_eq!(response.content, "Hello <INFO> done");
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.prompt_tokens, 12);
        assert_eq!(response.completion_tokens, 4);
    }

    #[tokio::test]
    async fn test_missing_choices_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(&spec(&server.uri())).unwrap();
        let err = backend
            .run(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UpstreamProtocol(_)));
    }

    #[tokio::test]
    async fn test_non_json_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(&spec(&server.uri())).unwrap();
        let err = backend
            .run(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UpstreamProtocol(_)));
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(&spec(&server.uri())).unwrap();
        let err = backend
            .run(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 429, .. }));
    }

    #[test]
    fn test_missing_api_key() {
        let mut s = spec("http://localhost");
        s.api_key = None;
        assert!(matches!(
            OpenAiBackend::new(&s),
            Err(BackendError::Configuration(_))
        ));
    }
}
