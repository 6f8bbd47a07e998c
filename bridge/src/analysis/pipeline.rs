//! Language-model analysis pipeline

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::text::{head_chars, parse_json_response, tokenize_sentences};
use super::{AnalysisResult, Analyzer, Chunk};
use crate::llm::{CompletionRequest, LanguageModel};

const CHUNKING_SYSTEM_PROMPT: &str = r#"You are a professional reading analyst.
Divide the following text into semantic chunks of 3-8 sentences each.

Output format: ONLY valid JSON array, no markdown, no explanation.
[
  {
    "title": "Chunk Title (max 8 words)",
    "summary": "2-3 sentence summary in English",
    "summary_zh": "中文摘要 (2-3 sentences)",
    "startIndex": 0,
    "endIndex": 4
  }
]

Rules:
- Indices refer to sentence positions (0-based)
- Cover ALL sentences: no gaps, no overlaps
- Chunks must follow the logical flow of the argument
- Identify transitions between ideas as natural chunk boundaries
- Do not overlap chunks"#;

const CORE_THESIS_PROMPT: &str = "Summarize the core thesis of this text in ONE sentence (max 30 words).
Focus on the main argument or central idea.
Output ONLY the thesis statement, nothing else.";

const DOCUMENT_SUMMARY_PROMPT: &str = "You are a professional reading analyst.
Create a structured summary that will guide semantic chunking.

Output format (plain text only, exact headings):
THESIS: <one sentence, max 30 words>
OUTLINE:
- <main point 1>
- <main point 2>
- <main point 3> (up to 6 points)";

const SUMMARY_INPUT_CHARS: usize = 3000;
const THESIS_INPUT_CHARS: usize = 2000;

/// Documents this short are a single chunk without asking the model.
const SINGLE_CHUNK_MAX_SENTENCES: usize = 5;

/// Summary, thesis and chunking via a [`LanguageModel`].
pub struct DocumentAnalyzer {
    model: Arc<dyn LanguageModel>,
}

impl DocumentAnalyzer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn summarize(&self, text: &str) -> String {
        let user = format!("Text:\n{}", head_chars(text, SUMMARY_INPUT_CHARS));
        match self
            .model
            .complete(CompletionRequest::new(DOCUMENT_SUMMARY_PROMPT, &user))
            .await
        {
            Ok(summary) => summary.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Summary generation failed, proceeding without");
                String::new()
            }
        }
    }

    async fn chunk(
        &self,
        text: &str,
        sentences: &[String],
        summary: &str,
    ) -> anyhow::Result<Vec<Chunk>> {
        if sentences.len() <= SINGLE_CHUNK_MAX_SENTENCES {
            return Ok(vec![Chunk {
                title: "Complete Text".to_string(),
                summary: sentences
                    .iter()
                    .take(2)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" "),
                summary_zh: String::new(),
                start_index: 0,
                end_index: sentences.len() - 1,
                original_text: text.to_string(),
                extra: Default::default(),
            }]);
        }

        let guidance = if summary.is_empty() {
            String::new()
        } else {
            format!("Document summary (for guidance):\n{}\n\n", summary)
        };
        let user = format!(
            "{}Text to analyze ({} sentences):\n{}",
            guidance,
            sentences.len(),
            text
        );
        let response = self
            .model
            .complete(CompletionRequest::new(CHUNKING_SYSTEM_PROMPT, &user))
            .await?;

        let mut chunks: Vec<Chunk> = serde_json::from_value(parse_json_response(&response)?)?;
        for chunk in &mut chunks {
            chunk.original_text = sentence_span(sentences, chunk.start_index, chunk.end_index);
        }
        Ok(chunks)
    }
}

/// Sentences `start..=end` joined by spaces, clamped to the available range.
fn sentence_span(sentences: &[String], start: usize, end: usize) -> String {
    let start = start.min(sentences.len());
    let end = end.saturating_add(1).min(sentences.len());
    if start >= end {
        return String::new();
    }
    sentences[start..end].join(" ")
}

#[async_trait]
impl Analyzer for DocumentAnalyzer {
    async fn analyze(&self, text: &str) -> anyhow::Result<AnalysisResult> {
        let sentences = tokenize_sentences(text);
        if sentences.is_empty() {
            anyhow::bail!("No sentences found in text");
        }

        let label = self.model.label();
        info!(sentences = sentences.len(), model = %label, "Analyzing document");

        let summary = self.summarize(text).await;

        let thesis_input = format!("Text:\n{}", head_chars(text, THESIS_INPUT_CHARS));
        let core_thesis = self
            .model
            .complete(CompletionRequest::new(CORE_THESIS_PROMPT, &thesis_input))
            .await?;

        let chunks = self.chunk(text, &sentences, &summary).await?;
        info!(chunks = chunks.len(), "Chunking complete");

        Ok(AnalysisResult {
            core_thesis: core_thesis.trim().to_string(),
            summary,
            model: label,
            chunks,
            title: String::new(),
        })
    }

    fn model_label(&self) -> String {
        self.model.label()
    }
}
