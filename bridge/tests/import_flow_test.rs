//! Client import flow against a live bridge server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge::analysis::{AnalysisResult, AnalysisService, Analyzer};
use bridge::api::{ApiServer, AppState};
use bridge::cache::{collections, CacheRegistry, CacheStore, SqliteDatabase};
use bridge::client::BridgeClient;
use bridge::config::Config;
use bridge::import::{ImportFlow, ImportOutcome, ImportRequest, ImportSource, ImportedDocument, ViewSink};
use bridge::poll::PollOptions;
use bridge::task::TaskRegistry;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const ESSAY: &str = "  Ownership is checked at compile time. Borrowing lets code share data.  ";

struct OneChunkAnalyzer;

#[async_trait]
impl Analyzer for OneChunkAnalyzer {
    async fn analyze(&self, text: &str) -> anyhow::Result<AnalysisResult> {
        Ok(AnalysisResult {
            core_thesis: "Ownership".to_string(),
            summary: String::new(),
            model: self.model_label(),
            chunks: vec![serde_json::from_value(json!({
                "title": "Complete Text",
                "originalText": text
            }))?],
            title: String::new(),
        })
    }

    fn model_label(&self) -> String {
        "test/one-chunk".to_string()
    }
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<ImportedDocument>>,
}

impl ViewSink for RecordingSink {
    fn publish(&self, document: &ImportedDocument) {
        self.published.lock().unwrap().push(document.clone());
    }
}

/// Server whose analysis cache lives in an in-memory SQLite collection.
async fn start_server() -> (String, CancellationToken) {
    let db = SqliteDatabase::in_memory().unwrap();
    let cache: Arc<dyn CacheStore> = Arc::new(db.collection(collections::ANALYSIS, Some(20)));
    let mut caches = CacheRegistry::new();
    caches.register(cache.clone());

    let analysis = Arc::new(AnalysisService::new(
        Arc::new(OneChunkAnalyzer),
        cache,
        Arc::new(TaskRegistry::new()),
        2,
    ));
    let server = ApiServer::new(AppState::new(analysis, Arc::new(caches)), &Config::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve_listener(listener, shutdown.clone()));
    (base_url, shutdown)
}

fn flow(base_url: &str, sink: Arc<RecordingSink>) -> ImportFlow {
    let backend = Arc::new(BridgeClient::new(base_url, None).unwrap());
    let local = SqliteDatabase::in_memory().unwrap();
    let local: Arc<dyn CacheStore> = Arc::new(local.collection(collections::ANALYSIS, Some(20)));
    ImportFlow::new(backend, local, sink)
        .with_poll_options(PollOptions::new(Duration::from_millis(20), Duration::from_secs(5)))
}

#[tokio::test]
async fn test_import_analyzes_then_hits_caches() {
    let (base_url, shutdown) = start_server().await;

    let sink = Arc::new(RecordingSink::default());
    let first = flow(&base_url, sink.clone());

    let outcome = first
        .run(ImportRequest::new(ESSAY).with_title("Ownership"))
        .await
        .unwrap();
    let ImportOutcome::Imported { hash, source } = outcome else {
        panic!("expected an import, got {:?}", outcome);
    };
    assert_eq!(source, ImportSource::Analyzed);
    assert_eq!(hash, bridge::hash::hash_text(ESSAY.trim()));

    let again = first.run(ImportRequest::new(ESSAY)).await.unwrap();
    assert_eq!(
        again,
        ImportOutcome::Imported {
            hash: hash.clone(),
            source: ImportSource::LocalCache
        }
    );

    let other_sink = Arc::new(RecordingSink::default());
    let second = flow(&base_url, other_sink.clone());
    let remote = second.run(ImportRequest::new(ESSAY)).await.unwrap();
    assert_eq!(
        remote,
        ImportOutcome::Imported {
            hash: hash.clone(),
            source: ImportSource::BridgeCache
        }
    );

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].title, "Ownership");
    assert_eq!(published[0].analysis["chunks"].as_array().unwrap().len(), 1);
    assert_eq!(other_sink.published.lock().unwrap().len(), 1);

    shutdown.cancel();
}
