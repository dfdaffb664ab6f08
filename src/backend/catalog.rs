//! Model catalog: platforms, base URLs, api styles and context windows.
//!
//! The built-in catalog can be extended or overridden by a `models.toml`:
//!
//! ```toml
//! [platforms.local]
//! base_url = "http://localhost:8000/v1"
//! api_types = ["openai"]
//! models = [{ name = "llama3", num_tokens = 8192 }]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;

/// A model offered by a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub num_tokens: u32,
}

/// A platform and the models it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEntry {
    pub base_url: String,
    pub api_types: Vec<String>,
    /// Endpoint used by non-openai api styles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

/// Everything needed to build one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub vendor: String,
    pub api_style: String,
    pub model: String,
    pub base_url: String,
    pub context_window: u32,
    pub api_key: Option<String>,
}

impl BackendSpec {
    /// Fill the API key from `<PLATFORM>_API_KEY`, falling back to `OPENAI_API_KEY`.
    pub fn with_api_key_from_env(mut self) -> Self {
        let var = format!("{}_API_KEY", self.vendor.to_uppercase());
        self.api_key = std::env::var(&var)
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub platforms: BTreeMap<String, PlatformEntry>,
}

fn platform(base_url: &str, api_types: &[&str], models: &[(&str, u32)]) -> PlatformEntry {
    PlatformEntry {
        base_url: base_url.to_string(),
        api_types: api_types.iter().map(|s| s.to_string()).collect(),
        native_base_url: None,
        models: models
            .iter()
            .map(|(name, num_tokens)| ModelEntry {
                name: name.to_string(),
                num_tokens: *num_tokens,
            })
            .collect(),
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let mut platforms = BTreeMap::new();
        platforms.insert(
            "openai".to_string(),
            platform(
                "https://api.openai.com/v1",
                &["openai"],
                &[("gpt-3.5-turbo", 4096), ("gpt-4", 8192)],
            ),
        );
        let mut qwen = platform(
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            &["openai", "self"],
            &[("qwen1.5-110-chat", 8192), ("qwen-plus", 8192)],
        );
        qwen.native_base_url = Some("https://dashscope.aliyuncs.com/api/v1".to_string());
        platforms.insert("qwen".to_string(), qwen);
        platforms.insert(
            "deepseek".to_string(),
            platform(
                "https://api.deepseek.com",
                &["openai"],
                &[("deepseek-chat", 8192), ("deepseek-reasoner", 8192)],
            ),
        );
        platforms.insert(
            "siliconflow".to_string(),
            platform(
                "https://api.siliconflow.cn/v1",
                &["openai"],
                &[("deepseek-ai/DeepSeek-R1", 8192), ("deepseek-ai/DeepSeek-V3", 8192)],
            ),
        );
        platforms.insert(
            "stub".to_string(),
            platform("", &["stub"], &[("stub", 4096)]),
        );
        Self { platforms }
    }
}

impl ModelCatalog {
    /// Built-in catalog, extended by `path` when it exists.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut catalog = Self::default();
        if path.exists() {
            let overrides = Self::load(path)?;
            catalog.merge(overrides);
        }
        Ok(catalog)
    }

    /// Load a catalog from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse model catalog: {}", path.display()))
    }

    /// Overlay `other`: whole platforms are replaced by name.
    pub fn merge(&mut self, other: ModelCatalog) {
        self.platforms.extend(other.platforms);
    }

    /// Resolve `(platform, model, api_type)` into a backend spec.
    ///
    /// `api_type` defaults to the first style the platform declares.
    pub fn resolve(
        &self,
        platform: &str,
        model: &str,
        api_type: Option<&str>,
    ) -> Result<BackendSpec, BackendError> {
        let entry = self.platforms.get(platform).ok_or_else(|| {
            BackendError::Configuration(format!("Unknown platform '{}'", platform))
        })?;

        let model_entry = entry
            .models
            .iter()
            .find(|m| m.name == model)
            .ok_or_else(|| {
                BackendError::Configuration(format!(
                    "Model '{}' is not offered by platform '{}'",
                    model, platform
                ))
            })?;

        let api_style = match api_type {
            Some(style) if entry.api_types.iter().any(|t| t == style) => style.to_string(),
            Some(style) => {
                return Err(BackendError::Configuration(format!(
                    "Platform '{}' does not support api type '{}' (supported: {})",
                    platform,
                    style,
                    entry.api_types.join(", ")
                )));
            }
            None => entry.api_types.first().cloned().ok_or_else(|| {
                BackendError::Configuration(format!("Platform '{}' declares no api type", platform))
            })?,
        };

        let base_url = match (&entry.native_base_url, api_style.as_str()) {
            (Some(native), style) if style != "openai" => native.clone(),
            _ => entry.base_url.clone(),
        };

        Ok(BackendSpec {
            vendor: platform.to_string(),
            api_style,
            model: model_entry.name.clone(),
            base_url,
            context_window: model_entry.num_tokens,
            api_key: None,
        })
    }
}
