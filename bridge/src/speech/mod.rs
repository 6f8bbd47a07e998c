//! Speech synthesis with per-kind caching
//!
//! Words repeat across documents and are always cached. Sub-word fragments
//! are cached only when they appear in [`COMMON_SYLLABLES`]. Sentences are
//! near-unique and go straight to the synthesizer.

mod openai;

pub use openai::OpenAiSpeech;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::prefetch::{Coalescer, PrefetchError};

/// Fragments frequent enough to be worth caching.
pub const COMMON_SYLLABLES: &[&str] = &[
    "tion", "sion", "ing", "ness", "ment", "able", "ible", "pre", "pro", "con", "dis", "un", "re",
    "ly", "ful", "less", "ous", "ive", "al", "er", "est", "ed", "en",
];

const WORD_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const SYLLABLE_SPEED: f32 = 0.7;

/// Text-to-speech backend
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`, returning WAV audio.
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> anyhow::Result<Bytes>;
}

/// `[speech]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_url() -> String {
    "http://localhost:8000/v1/audio/speech".to_string()
}

fn default_model() -> String {
    "qwen3-tts".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            model: default_model(),
            voice: default_voice(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Build the configured synthesizer.
pub fn create_synthesizer(config: &SpeechConfig) -> anyhow::Result<Arc<dyn SpeechSynthesizer>> {
    let speech = OpenAiSpeech::new(
        &config.url,
        &config.model,
        Duration::from_millis(config.timeout_ms),
    )?;
    Ok(Arc::new(speech))
}

pub fn is_common_syllable(text: &str) -> bool {
    COMMON_SYLLABLES.contains(&text)
}

fn encode_audio(audio: &Bytes) -> Value {
    json!({ "audio": STANDARD.encode(audio), "format": "wav" })
}

fn decode_audio(payload: &Value) -> Result<Bytes, PrefetchError> {
    let encoded = payload
        .get("audio")
        .and_then(Value::as_str)
        .ok_or_else(|| PrefetchError::Failed("cached audio entry has no audio field".into()))?;
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| PrefetchError::Failed(format!("invalid cached audio: {}", e)))
}

pub struct SpeechService {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    words: Coalescer,
    syllables: Coalescer,
    voice: String,
    retry_delay: Duration,
}

impl SpeechService {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        word_cache: Arc<dyn CacheStore>,
        syllable_cache: Arc<dyn CacheStore>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            synthesizer,
            words: Coalescer::new(word_cache),
            syllables: Coalescer::new(syllable_cache),
            voice: voice.into(),
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn fetch_word(
        &self,
        key: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, PrefetchError> {
        let synthesizer = self.synthesizer.clone();
        let voice = self.voice.clone();
        let text = key.to_string();
        self.words
            .get_or_fetch(key, cancel, move || async move {
                debug!(word = %text, "Synthesizing word");
                let audio = synthesizer.synthesize(&text, &voice, 1.0).await?;
                Ok(encode_audio(&audio))
            })
            .await
    }

    /// Audio for a single word, served from the `word_audio` cache when possible.
    ///
    /// Failures are retried twice; cancellation is returned at once.
    pub async fn speak_word(&self, word: &str) -> Result<Bytes, PrefetchError> {
        let key = word.to_lowercase();
        let mut attempt = 0;
        loop {
            match self.fetch_word(&key, None).await {
                Ok(payload) => return decode_audio(&payload),
                Err(e) if e.is_cancelled() || attempt >= WORD_RETRIES => return Err(e),
                Err(e) => {
                    attempt += 1;
                    info!(word = %key, attempt, error = %e, "Retrying word audio");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Make sure a word's audio is cached, without decoding it.
    pub async fn prefetch_word(
        &self,
        word: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), PrefetchError> {
        self.fetch_word(&word.to_lowercase(), cancel).await.map(|_| ())
    }

    pub async fn is_word_cached(&self, word: &str) -> bool {
        self.words.cached(&word.to_lowercase()).await.is_some()
    }

    /// Audio for a sub-word fragment, spoken slowly.
    pub async fn speak_syllable(&self, syllable: &str) -> Result<Bytes, PrefetchError> {
        let text = syllable.to_lowercase();
        if !is_common_syllable(&text) {
            return self.synthesize(&text, SYLLABLE_SPEED).await;
        }

        let synthesizer = self.synthesizer.clone();
        let voice = self.voice.clone();
        let input = text.clone();
        let payload = self
            .syllables
            .get_or_fetch(&text, None, move || async move {
                let audio = synthesizer.synthesize(&input, &voice, SYLLABLE_SPEED).await?;
                Ok(encode_audio(&audio))
            })
            .await?;
        decode_audio(&payload)
    }

    /// Audio for a whole sentence. Never cached.
    pub async fn speak_sentence(&self, sentence: &str) -> Result<Bytes, PrefetchError> {
        debug!(chars = sentence.chars().count(), "Synthesizing sentence (uncached)");
        self.synthesize(sentence, 1.0).await
    }

    async fn synthesize(&self, text: &str, speed: f32) -> Result<Bytes, PrefetchError> {
        self.synthesizer
            .synthesize(text, &self.voice, speed)
            .await
            .map_err(|e| PrefetchError::Failed(e.to_string()))
    }

    /// Abort every in-flight synthesis.
    pub fn cancel_all(&self) -> usize {
        self.words.cancel_all() + self.syllables.cancel_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteDatabase;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeSynth {
        calls: Mutex<Vec<(String, f32)>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, text: &str, _voice: &str, speed: f32) -> anyhow::Result<Bytes> {
            self.calls.lock().push((text.to_string(), speed));
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("TTS API Error: Service Unavailable");
                }
            }
            Ok(Bytes::from(format!("wav:{}", text)))
        }
    }

    fn service(synth: Arc<FakeSynth>) -> (SpeechService, SqliteDatabase) {
        let db = SqliteDatabase::in_memory().unwrap();
        let service = SpeechService::new(
            synth,
            Arc::new(db.collection("word_audio", Some(500))),
            Arc::new(db.collection("syllable_audio", Some(500))),
            "default",
        )
        .with_retry_delay(Duration::from_millis(1));
        (service, db)
    }

    #[tokio::test]
    async fn test_word_is_cached_case_insensitively() {
        let synth = Arc::new(FakeSynth::default());
        let (speech, _db) = service(synth.clone());

        assert_eq!(speech.speak_word("Hello").await.unwrap(), Bytes::from("wav:hello"));
        assert_eq!(speech.speak_word("hello").await.unwrap(), Bytes::from("wav:hello"));
        assert!(speech.is_word_cached("HELLO").await);
        assert_eq!(synth.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_word_retries_then_succeeds() {
        let synth = Arc::new(FakeSynth {
            failures_left: Mutex::new(2),
            ..Default::default()
        });
        let (speech, _db) = service(synth.clone());

        assert!(speech.speak_word("retry").await.is_ok());
        assert_eq!(synth.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_word_gives_up_after_retries() {
        let synth = Arc::new(FakeSynth {
            failures_left: Mutex::new(5),
            ..Default::default()
        });
        let (speech, _db) = service(synth.clone());

        let err = speech.speak_word("broken").await.unwrap_err();
        assert!(matches!(err, PrefetchError::Failed(msg) if msg.contains("TTS API Error")));
        assert_eq!(synth.calls.lock().len(), 3);
        assert!(!speech.is_word_cached("broken").await);
    }

    #[tokio::test]
    async fn test_only_common_syllables_are_cached() {
        let synth = Arc::new(FakeSynth::default());
        let (speech, db) = service(synth.clone());

        speech.speak_syllable("TION").await.unwrap();
        speech.speak_syllable("tion").await.unwrap();
        speech.speak_syllable("zorp").await.unwrap();
        speech.speak_syllable("zorp").await.unwrap();

        let calls = synth.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, speed)| (*speed - 0.7).abs() < f32::EPSILON));

        let syllables = db.collection("syllable_audio", Some(500));
        assert_eq!(syllables.list().await.unwrap(), vec!["tion"]);
    }

    #[tokio::test]
    async fn test_sentences_are_never_cached() {
        let synth = Arc::new(FakeSynth::default());
        let (speech, db) = service(synth.clone());

        speech.speak_sentence("A whole sentence.").await.unwrap();
        speech.speak_sentence("A whole sentence.").await.unwrap();

        assert_eq!(synth.calls.lock().len(), 2);
        let words = db.collection("word_audio", Some(500));
        assert!(words.is_empty().await.unwrap());
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        assert!(decode_audio(&json!({"format": "wav"})).is_err());
        assert!(decode_audio(&json!({"audio": "%%%"})).is_err());
        let audio = Bytes::from_static(b"RIFF");
        assert_eq!(decode_audio(&encode_audio(&audio)).unwrap(), audio);
    }
}
