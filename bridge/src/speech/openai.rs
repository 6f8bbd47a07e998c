//! OpenAI-compatible `/v1/audio/speech` client

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;

use super::SpeechSynthesizer;

pub struct OpenAiSpeech {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

impl OpenAiSpeech {
    pub fn new(url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .post(&self.url)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice,
                speed,
                response_format: "wav",
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "TTS API Error: {}",
                status.canonical_reason().unwrap_or(status.as_str())
            );
        }

        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(SpeechRequest {
            model: "qwen3-tts",
            input: "hello",
            voice: "default",
            speed: 0.5,
            response_format: "wav",
        })
        .unwrap();
        assert_eq!(body["input"], "hello");
        assert_eq!(body["speed"], 0.5);
        assert_eq!(body["response_format"], "wav");
    }

    #[tokio::test]
    #[ignore = "requires running TTS server"]
    async fn test_synthesize() {
        let speech = OpenAiSpeech::new(
            "http://localhost:8000/v1/audio/speech",
            "qwen3-tts",
            Duration::from_secs(30),
        )
        .unwrap();
        let audio = speech.synthesize("hello", "default", 1.0).await.unwrap();
        assert!(!audio.is_empty());
    }
}
