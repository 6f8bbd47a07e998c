//! OpenAI-compatible completion provider
//!
//! Works with OpenAI, DeepSeek, GLM and other `/chat/completions` APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionRequest, LanguageModel};

pub struct OpenAiCompatModel {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

impl OpenAiCompatModel {
    pub fn new(url: &str, api_key: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", api_key).parse()?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatModel {
    async fn complete(&self, request: CompletionRequest<'_>) -> anyhow::Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: request.user,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let data: ChatResponse = response.json().await?;

        if !status.is_success() {
            let message = data
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("LLM error: {}", status.as_u16()));
            anyhow::bail!(message);
        }

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("LLM returned empty content"))
    }

    fn label(&self) -> String {
        format!("openai/{}", self.model)
    }
}
