//! warm-audio: fill the local word audio cache for a document.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use bridge::cache::{collections, default_capacity, SqliteDatabase};
use bridge::prefetch::SpeechWarmup;
use bridge::speech::{create_synthesizer, SpeechConfig, SpeechService};
use regex::Regex;

/// Words the warm-up queue accepts per batch.
const BATCH: usize = 12;

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot determine home directory")?;
    Ok(home.join(".deep-bridge").join("client.db"))
}

/// Unique lowercase words of at least two letters, in first-seen order.
pub fn extract_words(text: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(r"[A-Za-z][A-Za-z']*[A-Za-z]")?;
    let mut seen = HashSet::new();
    Ok(pattern
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| seen.insert(w.clone()))
        .collect())
}

pub async fn run_warm_audio(file: &Path, db: Option<PathBuf>, tts_url: Option<String>) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Error reading file {}", file.display()))?;
    let words = extract_words(&text)?;
    if words.is_empty() {
        println!("No words found in {}", file.display());
        return Ok(());
    }

    let db_path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let database = SqliteDatabase::open(&db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;

    let mut config = SpeechConfig::default();
    if let Some(url) = tts_url {
        config.url = url;
    }
    let synthesizer = create_synthesizer(&config)?;
    let speech = Arc::new(SpeechService::new(
        synthesizer,
        Arc::new(database.collection(
            collections::WORD_AUDIO,
            default_capacity(collections::WORD_AUDIO),
        )),
        Arc::new(database.collection(
            collections::SYLLABLE_AUDIO,
            default_capacity(collections::SYLLABLE_AUDIO),
        )),
        config.voice.clone(),
    ));
    let warmup = SpeechWarmup::new(speech.clone());

    println!("Warming audio for {} words via {}...", words.len(), config.url);
    let mut queued = 0;
    for batch in words.chunks(BATCH) {
        queued += warmup.enqueue(batch).await;
        warmup.wait_idle().await;
    }

    let mut cached = 0;
    for word in &words {
        if speech.is_word_cached(word).await {
            cached += 1;
        }
    }
    println!(
        "Done: {} fetched, {}/{} words cached in {}",
        queued,
        cached,
        words.len(),
        db_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_words() {
        let words = extract_words("The cat's hat. THE cat sat, a hat!").unwrap();
        assert_eq!(words, vec!["the", "cat's", "hat", "cat", "sat"]);
    }

    #[test]
    fn test_extract_words_empty() {
        assert!(extract_words("1 2 3 - !").unwrap().is_empty());
    }
}
