//! DashScope native text-generation adapter (qwen, api style `self`).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    BackendSpec, ChatMessage, CompletionRequest, CompletionResponse, ModelBackend, pricing, tokens,
};
use crate::errors::BackendError;

const GENERATION_PATH: &str = "/services/aigc/text-generation/generation";

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: GenerationInput<'a>,
    parameters: GenerationParameters,
}

#[derive(Debug, Serialize)]
struct GenerationInput<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Serialize)]
struct GenerationParameters {
    result_format: &'static str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    output: GenerationOutput,
    usage: GenerationUsage,
}

#[derive(Debug, Deserialize)]
struct GenerationOutput {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Client for the DashScope generation API.
#[derive(Clone)]
pub struct DashScopeBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: u32,
}

impl DashScopeBackend {
    pub fn new(spec: &BackendSpec) -> Result<Self, BackendError> {
        let api_key = std::env::var("DASHSCOPE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| spec.api_key.clone())
            .ok_or_else(|| {
                BackendError::Configuration(
                    "No API key for DashScope (set DASHSCOPE_API_KEY or OPENAI_API_KEY)".to_string(),
                )
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
impl ModelBackend for DashScopeBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn run(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let max_tokens = request.max_tokens.unwrap_or_else(|| {
            tokens::completion_budget(&request.messages, self.context_window)
        });

        debug!(
            "Creating generation with {} messages, model {}, max_tokens {}",
            request.messages.len(),
            self.model,
            max_tokens
        );

        let body = GenerationRequest {
            model: &self.model,
            input: GenerationInput {
                messages: &request.messages,
            },
            parameters: GenerationParameters {
                result_format: "text",
                max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
            },
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, GENERATION_PATH))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            error!("DashScope generation failed with status {}: {}", status, text);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: GenerationResponse = serde_json::from_str(&text).map_err(|e| {
            BackendError::UpstreamProtocol(format!("invalid DashScope body: {}", e))
        })?;

        pricing::log_usage(
            &self.model,
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
        );

        Ok(CompletionResponse {
            content: parsed.output.text,
            finish_reason: parsed
                .output
                .finish_reason
                .unwrap_or_else(|| "stop".to_string()),
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
        })
    }
}
