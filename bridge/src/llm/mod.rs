//! Language-model providers
//!
//! Request/response completion backends used by the analysis pipeline and
//! the annotation prefetchers. Providers are plain HTTP clients; callers
//! cancel a call by dropping its future.

mod ollama;
mod openai;

pub use ollama::OllamaModel;
pub use openai::OpenAiCompatModel;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which wire protocol to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Ollama `/api/generate`
    #[default]
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint (DeepSeek, GLM, ...)
    #[serde(alias = "deepseek", alias = "glm")]
    OpenAi,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAi => "openai",
        }
    }

    /// Parse a provider name; anything other than `ollama` is OpenAI-compatible.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("ollama") {
            LlmProvider::Ollama
        } else {
            LlmProvider::OpenAi
        }
    }
}

/// `[llm]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Required for OpenAI-compatible providers
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "qwen2.5:7b".to_string()
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `provider/model`, recorded on every analysis result.
    pub fn model_label(&self) -> String {
        format!("{}/{}", self.provider.as_str(), self.model)
    }
}

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub system: Option<&'a str>,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(system: &'a str, user: &'a str) -> Self {
        Self {
            system: Some(system),
            user,
            temperature: 0.3,
            max_tokens: 2048,
        }
    }
}

/// Trait for completion backends
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one completion and return the generated text.
    async fn complete(&self, request: CompletionRequest<'_>) -> anyhow::Result<String>;

    /// `provider/model` label
    fn label(&self) -> String;
}

/// Create a language model from configuration
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Box<dyn LanguageModel>> {
    match config.provider {
        LlmProvider::Ollama => Ok(Box::new(OllamaModel::new(
            &config.base_url,
            &config.model,
            config.timeout(),
        )?)),
        LlmProvider::OpenAi => {
            let api_key = config
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    anyhow::anyhow!("LLM_API_KEY is required for non-Ollama providers")
                })?;
            Ok(Box::new(OpenAiCompatModel::new(
                &config.base_url,
                api_key,
                &config.model,
                config.timeout(),
            )?))
        }
    }
}
