//! Per-chunk and per-sentence annotations produced by a language model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::analysis::text::{head_chars, parse_json_response, tokenize_sentences};
use crate::llm::{CompletionRequest, LanguageModel};

const KEYWORD_EXTRACTION_PROMPT: &str = r#"You are a vocabulary extraction assistant for English learners.
Extract 5-8 key vocabulary words from this paragraph.

For each word provide:
- word: the word itself
- phonetic: IPA transcription (use full word transcription)
- pos: part of speech (e.g., n., v., adj., adv., phr.)
- slices: split the word into logical syllable blocks. Output as an array of tuples: [["text", "ipa"], ...].
    - text: the character slice
    - ipa: the IPA transcription for JUST that slice
- definition: brief definition in English (20 words max)
- definition_zh: brief definition in Chinese (7 words max)
- newContext: a NEW example sentence using the word (different from the original sentence), preferably from a real-world context.

Output ONLY valid JSON array:
[
  {
    "word": "aggregate",
    "phonetic": "/ˈæɡrɪɡeɪt/",
    "pos": "v.",
    "slices": [["ag", "ˈæɡ"], ["gre", "rɪ"], ["gate", "ɡeɪt"]],
    "definition": "to collect or gather into a whole",
    "definition_zh": "集合；合计",
    "newContext": "We need to aggregate the data from multiple sources to get a clear picture."
  }
]

Prioritize:
1. Domain-specific or technical terms
2. Advanced vocabulary (CEFR B2+)
3. Words crucial to understanding the argument
4. Skip common words (the, is, have, etc.)"#;

const THOUGHT_GROUP_PROMPT: &str = r#"You are a linguistic expert specializing in English prosody and syntax.
Your task is to divide a given sentence into "Thought Groups" (semantic chunks) to help learners with phrasing and rhythm.

Rules:
- Divide based on natural pauses, grammatical boundaries, and meaningful units.
- Each group should be 2-5 words.
- Provide a brief "focus hint" for each group (e.g., "subject", "action", "detail").

Output ONLY valid JSON array:
[
  {"text": "The rapid advancement", "hint": "subject"},
  {"text": "of artificial intelligence", "hint": "modifier"}
]"#;

const TRANSLATION_PROMPT: &str = "You are a professional translator.
Translate the following English sentences into natural, accurate Chinese.
Return ONLY a JSON array of strings, in the same order as the input.";

/// Characters of chunk text used when no sentence contains the keyword.
const SENTENCE_FALLBACK_CHARS: usize = 100;

/// One syllable block of a keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub text: String,
    #[serde(default)]
    pub phonetic: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SliceRepr {
    Tuple(Vec<String>),
    Object(Slice),
}

impl From<SliceRepr> for Slice {
    fn from(repr: SliceRepr) -> Self {
        match repr {
            SliceRepr::Object(slice) => slice,
            SliceRepr::Tuple(parts) => {
                let mut parts = parts.into_iter();
                Slice {
                    text: parts.next().unwrap_or_default(),
                    phonetic: parts.next().unwrap_or_default(),
                }
            }
        }
    }
}

/// Slices arrive either as `[["ag", "ˈæɡ"]]` tuples or as objects.
fn deserialize_slices<'de, D>(deserializer: D) -> Result<Vec<Slice>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<SliceRepr>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Slice::from).collect())
}

/// A vocabulary item extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyword {
    pub word: String,
    #[serde(default)]
    pub phonetic: String,
    #[serde(default)]
    pub pos: String,
    #[serde(default, deserialize_with = "deserialize_slices")]
    pub slices: Vec<Slice>,
    #[serde(default)]
    pub definition: String,
    #[serde(default, rename = "definition_zh")]
    pub definition_zh: String,
    #[serde(default)]
    pub new_context: String,
    /// Sentence of the chunk the word appears in
    #[serde(default)]
    pub sentence: String,
}

/// A short phrase of a sentence, read as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtGroup {
    pub text: String,
    #[serde(default)]
    pub hint: String,
}

/// Produces the annotations the reader prefetches.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn extract_keywords(&self, chunk_text: &str) -> anyhow::Result<Vec<Keyword>>;

    /// Translations in input order.
    async fn translate_sentences(&self, sentences: &[String]) -> anyhow::Result<Vec<String>>;

    async fn split_thought_groups(&self, sentence: &str) -> anyhow::Result<Vec<ThoughtGroup>>;

    /// `provider/model`, part of the thought-group cache key
    fn model_label(&self) -> String;
}

/// Fill in `sentence` for keywords the model left without one.
pub fn attach_sentences(keywords: &mut [Keyword], chunk_text: &str) {
    let sentences = tokenize_sentences(chunk_text);
    let lowered: Vec<String> = sentences.iter().map(|s| s.to_lowercase()).collect();

    for keyword in keywords.iter_mut().filter(|k| k.sentence.is_empty()) {
        let target = keyword.word.to_lowercase();
        keyword.sentence = match lowered.iter().position(|s| s.contains(&target)) {
            Some(idx) => sentences[idx].clone(),
            None => format!("{}...", head_chars(chunk_text, SENTENCE_FALLBACK_CHARS)),
        };
    }
}

/// [`Annotator`] backed by a [`LanguageModel`].
pub struct LlmAnnotator {
    model: Arc<dyn LanguageModel>,
}

impl LlmAnnotator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Annotator for LlmAnnotator {
    async fn extract_keywords(&self, chunk_text: &str) -> anyhow::Result<Vec<Keyword>> {
        let user = format!("Paragraph:\n{}", chunk_text);
        let response = self
            .model
            .complete(CompletionRequest::new(KEYWORD_EXTRACTION_PROMPT, &user))
            .await?;

        let mut keywords: Vec<Keyword> = serde_json::from_value(parse_json_response(&response)?)?;
        attach_sentences(&mut keywords, chunk_text);
        debug!(count = keywords.len(), "Extracted keywords");
        Ok(keywords)
    }

    async fn translate_sentences(&self, sentences: &[String]) -> anyhow::Result<Vec<String>> {
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let user = format!(
            "Sentences:\n{}\n\nOutput Format:\n[\"翻译1\", \"翻译2\", ...]",
            serde_json::to_string(sentences)?
        );
        let response = self
            .model
            .complete(CompletionRequest::new(TRANSLATION_PROMPT, &user))
            .await?;
        Ok(serde_json::from_value(parse_json_response(&response)?)?)
    }

    async fn split_thought_groups(&self, sentence: &str) -> anyhow::Result<Vec<ThoughtGroup>> {
        let user = format!("Sentence:\n{}", sentence);
        let response = self
            .model
            .complete(CompletionRequest::new(THOUGHT_GROUP_PROMPT, &user))
            .await?;
        Ok(serde_json::from_value(parse_json_response(&response)?)?)
    }

    fn model_label(&self) -> String {
        self.model.label()
    }
}
