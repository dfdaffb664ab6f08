//! Model backends.
//!
//! A backend turns a normalized completion request into one vendor call and
//! maps the answer back to [`CompletionResponse`]. Adapters are selected by a
//! registration table keyed by `(vendor, api_style)`:
//!
//! | vendor        | api style | adapter            |
//! |---------------|-----------|--------------------|
//! | openai        | openai    | [`OpenAiBackend`]  |
//! | qwen          | openai    | [`OpenAiBackend`]  |
//! | qwen          | self      | [`DashScopeBackend`]|
//! | deepseek      | openai    | [`OpenAiBackend`]  |
//! | siliconflow   | openai    | [`OpenAiBackend`]  |
//! | stub          | stub      | [`StubBackend`]    |
//!
//! Adding a vendor means registering one more constructor; the chain engine
//! never branches on vendor names.

pub mod catalog;
pub mod dashscope;
pub mod openai;
pub mod pricing;
pub mod stub;
pub mod tokens;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;

pub use catalog::{BackendSpec, ModelCatalog};
pub use dashscope::DashScopeBackend;
pub use openai::OpenAiBackend;
pub use stub::StubBackend;

/// Finish reason reported when a vendor filtered the completion.
pub const FINISH_CONTENT_FILTER: &str = "content_filter";

/// Role in a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A normalized completion request.
///
/// `max_tokens` overrides the budget the backend would otherwise derive from
/// its context window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }
}

/// A normalized completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One vendor capability set.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model name sent to the vendor and used for pricing.
    fn model_name(&self) -> &str;

    /// Context window of the model, in tokens.
    fn context_window(&self) -> u32;

    /// Run one completion. Blocks the caller until the vendor answers.
    async fn run(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError>;
}

/// Builds a backend from a resolved spec.
pub type BackendConstructor =
    fn(&BackendSpec) -> Result<Arc<dyn ModelBackend>, BackendError>;

/// Registration table keyed by `(vendor, api_style)`.
#[derive(Clone)]
pub struct BackendRegistry {
    table: HashMap<(String, String), BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for vendor in ["openai", "qwen", "deepseek", "siliconflow"] {
            registry.register(vendor, "openai", OpenAiBackend::construct);
        }
        registry.register("qwen", "self", DashScopeBackend::construct);
        registry.register("stub", "stub", StubBackend::construct);
        registry
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, vendor: &str, api_style: &str, constructor: BackendConstructor) {
        self.table
            .insert((vendor.to_string(), api_style.to_string()), constructor);
    }

    pub fn supports(&self, vendor: &str, api_style: &str) -> bool {
        self.table
            .contains_key(&(vendor.to_string(), api_style.to_string()))
    }

    /// Build the backend for `spec`.
    pub fn create(&self, spec: &BackendSpec) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let constructor = self
            .table
            .get(&(spec.vendor.clone(), spec.api_style.clone()))
            .ok_or_else(|| BackendError::Unregistered {
                vendor: spec.vendor.clone(),
                api_style: spec.api_style.clone(),
            })?;
        constructor(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(vendor: &str, api_style: &str) -> BackendSpec {
        BackendSpec {
            vendor: vendor.into(),
            api_style: api_style.into(),
            model: "m".into(),
            base_url: "http://localhost".into(),
            context_window: 4096,
            api_key: Some("key".into()),
        }
    }

    #[test]
    fn test_default_registry_resolves_known_pairs() {
        let registry = BackendRegistry::default();
        assert!(registry.supports("qwen", "self"));
        assert!(registry.supports("deepseek", "openai"));

        let backend = registry.create(&spec("stub", "stub")).unwrap();
        assert_eq!(backend.context_window(), 4096);
    }

    #[test]
    fn test_unregistered_pair_fails() {
        let registry = BackendRegistry::default();
        let err = registry.create(&spec("deepseek", "self")).err().unwrap();
        assert!(matches!(err, BackendError::Unregistered { .. }));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = BackendRegistry::empty();
        assert!(!registry.supports("stub", "stub"));
        registry.register("local", "stub", StubBackend::construct);
        assert!(registry.create(&spec("local", "stub")).is_ok());
    }

    #[test]
    fn test_total_tokens() {
        let response = CompletionResponse {
            content: "x".into(),
            finish_reason: "stop".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        assert_eq!(response.total_tokens(), 15);
    }
}
