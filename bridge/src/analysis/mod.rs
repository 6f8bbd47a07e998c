//! Document analysis
//!
//! The expensive computation behind `POST /api/content/analyze`: summary,
//! core thesis and semantic chunking of a document by a language model.
//! [`AnalysisService`] wraps it in the task lifecycle and the analysis cache.

mod pipeline;
mod service;
pub mod text;

pub use pipeline::DocumentAnalyzer;
pub use service::{AnalysisService, AnalyzeRequest, Submission};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum accepted document length, in characters.
pub const MAX_CONTENT_LENGTH: usize = 50_000;

/// One semantic chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, rename = "summary_zh")]
    pub summary_zh: String,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub end_index: usize,
    #[serde(default)]
    pub original_text: String,
    /// Anything else the model returned
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of analysing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub core_thesis: String,
    #[serde(default)]
    pub summary: String,
    /// `provider/model` that produced the result
    pub model: String,
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub title: String,
}

/// Trait for document analysers
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyse a whole document. Errors are task-level failures.
    async fn analyze(&self, text: &str) -> anyhow::Result<AnalysisResult>;

    /// `provider/model` label
    fn model_label(&self) -> String;
}
