//! send / push / cache: submit a document and wait for its analysis.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use bridge::api::types::SubmitRequest;
use bridge::poll::{PollOptions, PollingClient};

use super::Context;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Title for a file: its name without the extension.
fn title_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string())
}

pub async fn run_file(ctx: &Context, path: &Path, cache_only: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading file {}", path.display()))?;
    let title = title_for(path);
    println!("Sending \"{}\" ({} chars)...", title, content.chars().count());

    analyze(ctx, content, title, cache_only).await
}

pub async fn run_stdin(ctx: &Context) -> Result<()> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .context("Failed to read stdin")?;
    if content.trim().is_empty() {
        bail!("No content received from stdin");
    }
    println!("Received {} chars from stdin...", content.chars().count());

    analyze(ctx, content, "stdin-import".to_string(), false).await
}

async fn analyze(ctx: &Context, content: String, title: String, cache_only: bool) -> Result<()> {
    let client = Arc::new(ctx.client()?);
    let request = SubmitRequest {
        content,
        title: Some(title),
        cache_only,
        source: Some("cli".to_string()),
    };

    let response = client.submit_analysis(&request).await.with_context(|| {
        format!("Cannot reach Bridge Server at {}", client.base_url())
    })?;

    if response.cache_hit {
        println!("Cache hit! Content already analyzed.");
        println!("  Hash: {}", response.content_hash);
        if !cache_only {
            println!("Open {}", ctx.reader_url(&response.content_hash));
        }
        return Ok(());
    }

    let Some(task_id) = response.task_id else {
        bail!("Bridge Server queued the analysis without a task id");
    };
    println!("Task {} queued, waiting for analysis...", task_id);

    let poller = PollingClient::new(client.clone());
    let options = PollOptions::new(POLL_INTERVAL, POLL_TIMEOUT);
    let outcome = poller
        .poll_until_terminal(&task_id, &options, |_| {
            print!(".");
            let _ = std::io::stdout().flush();
        })
        .await;
    println!();

    let task = outcome.with_context(|| format!("Task {} did not complete", task_id))?;
    let chunks = task
        .result
        .as_ref()
        .and_then(|r| r["chunks"].as_array())
        .map_or(0, Vec::len);
    println!("Analysis complete - {} chunks", chunks);
    println!("  Hash: {}", task.content_hash);
    if !cache_only {
        println!("Open {}", ctx.reader_url(&task.content_hash));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_strips_extension() {
        assert_eq!(title_for(Path::new("/tmp/notes/essay.md")), "essay");
        assert_eq!(title_for(Path::new("README")), "README");
    }

    #[test]
    fn test_reader_url() {
        let ctx = Context {
            bridge_url: "http://localhost:3737".into(),
            api_key: None,
            frontend_url: "http://localhost:5173/".into(),
        };
        assert_eq!(ctx.reader_url("abc"), "http://localhost:5173/?bridgeHash=abc");
    }
}
