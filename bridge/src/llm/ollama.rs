//! Ollama completion provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionRequest, LanguageModel};

/// Ollama `/api/generate` provider
pub struct OllamaModel {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaModel {
    pub fn new(url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn complete(&self, request: CompletionRequest<'_>) -> anyhow::Result<String> {
        let prompt = match request.system {
            Some(system) => format!("{}\n\n{}", system, request.user),
            None => request.user.to_string(),
        };
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama error: {}", response.status().as_u16());
        }

        let data: GenerateResponse = response.json().await?;
        Ok(data.response)
    }

    fn label(&self) -> String {
        format!("ollama/{}", self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = GenerateRequest {
            model: "qwen2.5:7b",
            prompt: "hi".into(),
            stream: false,
            options: GenerateOptions {
                temperature: 0.3,
                num_predict: 2048,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 2048);
    }

    // Integration test - requires running Ollama with qwen2.5:7b
    #[tokio::test]
    #[ignore = "requires running Ollama server"]
    async fn test_ollama_complete() {
        let model =
            OllamaModel::new("http://localhost:11434", "qwen2.5:7b", Duration::from_secs(60))
                .unwrap();
        let text = model
            .complete(CompletionRequest::new("Answer in one word.", "Capital of France?"))
            .await
            .unwrap();
        assert!(!text.is_empty());
    }
}
