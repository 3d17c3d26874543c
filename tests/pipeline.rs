//! End-to-end runs of the three entry points against in-process fakes.
//!
//! No network: storage, OCR and completion services are replaced by the
//! fakes below, which record every call so tests can assert on what the
//! pipeline did (and did not) do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan2epub::pipeline::epub::{read_epub, write_epub, EpubChapter, EpubDocument, EpubMetadata};
use scan2epub::pipeline::extract::xhtml_to_text;
use scan2epub::pipeline::llm::{Completion, CompletionClient, CompletionRequest};
use scan2epub::pipeline::ocr::{OcrOrchestrator, OcrPayload, OcrService, PollResponse};
use scan2epub::pipeline::storage::{BlobLifecycleManager, BlobStore};
use scan2epub::{
    run_cleanup, run_full_pipeline, run_ocr, CompletionError, ErrorKind, OcrBackends,
    PipelineConfig, ScanError, Session, StorageConfig,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MemoryStore {
    fn live(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_container(&self, _container: &str) -> Result<(), ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload(&self, container: &str, name: &str, _bytes: Vec<u8>) -> Result<String, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().push(name.to_string());
        Ok(format!("mem://{container}/{name}"))
    }

    fn access_descriptor(
        &self,
        container: &str,
        name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ScanError> {
        Ok(format!("mem://{container}/{name}?se={}", expires_at.timestamp()))
    }

    async fn delete(&self, _container: &str, name: &str) -> Result<(), ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.deletes.lock().unwrap().push(name.to_string());
        self.objects.lock().unwrap().retain(|n| n != name);
        Ok(())
    }
}

/// Replays a poll script. Submits numbered in `fail_submit_on` are rejected.
struct ScriptedOcr {
    polls: Mutex<VecDeque<PollResponse>>,
    submitted: Mutex<Vec<String>>,
    fail_submit_on: Option<usize>,
}

impl ScriptedOcr {
    fn new(polls: Vec<PollResponse>) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            submitted: Mutex::new(Vec::new()),
            fail_submit_on: None,
        }
    }

    fn succeeding(pages: &[&str]) -> Self {
        Self::new(vec![
            PollResponse::running(),
            PollResponse::running(),
            PollResponse::succeeded(OcrPayload::from_pages(pages.iter().copied())),
        ])
    }

    fn submits(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrService for ScriptedOcr {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, source_url: &str) -> Result<String, ScanError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(source_url.to_string());
        if self.fail_submit_on == Some(submitted.len()) {
            return Err(ScanError::ocr_status(400, "InvalidRequest"));
        }
        Ok(format!("job-{}", submitted.len()))
    }

    async fn poll(&self, _job_id: &str) -> Result<PollResponse, ScanError> {
        Ok(self
            .polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PollResponse::succeeded(OcrPayload::from_pages(["Page"]))))
    }
}

/// Upper-cases every chunk, so cleaned text is easy to spot in the output.
#[derive(Default)]
struct UppercaseClient {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for UppercaseClient {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: request.user.to_uppercase(),
            input_tokens: request.user.len(),
            output_tokens: request.user.len(),
        })
    }
}

#[derive(Default)]
struct BrokenClient {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for BrokenClient {
    fn name(&self) -> &str {
        "broken"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CompletionError::transient("503 Service Unavailable"))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const PAGES: &[&str] = &[
    "Első fejezet",
    "Ez az első bekezdés szövege, amely egy teljes mondat.",
    "A második oldal szintén egy mondattal zárul.",
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .retry_backoff_ms(1)
        .language("hu")
        .build()
        .unwrap()
}

fn scan_file(dir: &tempfile::TempDir, len: usize) -> PathBuf {
    let path = dir.path().join("konyv.pdf");
    std::fs::write(&path, vec![b'%'; len]).unwrap();
    path
}

fn backends(ocr: Arc<ScriptedOcr>, store: Option<Arc<MemoryStore>>) -> OcrBackends {
    OcrBackends {
        ocr,
        storage: store.map(|s| s as Arc<dyn BlobStore>),
    }
}

fn book_text(path: &Path) -> String {
    let doc = read_epub(path).unwrap();
    doc.chapters
        .iter()
        .map(|c| xhtml_to_text(&c.xhtml))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── OCR mode ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn url_input_is_sent_to_ocr_without_upload() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("raw.epub");
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));

    let outcome = assert_ok!(
        run_ocr(
            "https://example.com/scans/konyv.pdf",
            &output,
            &backends(ocr.clone(), None),
            &config(),
        )
        .await
    );

    assert_eq!(ocr.submits(), vec!["https://example.com/scans/konyv.pdf"]);
    assert_eq!(outcome.polls, 3);
    assert_eq!(outcome.sleeps, 2);
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(outcome.output_path.as_deref(), Some(output.as_path()));

    let doc = read_epub(&output).unwrap();
    assert_eq!(doc.metadata.title, "konyv");
    assert_eq!(doc.metadata.language, "hu");
    assert_eq!(doc.chapters.len(), 1);
    assert!(book_text(&output).contains("amely egy teljes mondat."));
}

#[tokio::test(start_paused = true)]
async fn local_input_is_uploaded_then_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let input = scan_file(&dir, 64);
    let output = dir.path().join("raw.epub");
    let store = Arc::new(MemoryStore::default());
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));

    let outcome = run_ocr(
        input.to_str().unwrap(),
        &output,
        &backends(ocr.clone(), Some(store.clone())),
        &config(),
    )
    .await
    .unwrap();

    let submits = ocr.submits();
    assert_eq!(submits.len(), 1);
    assert!(submits[0].starts_with("mem://scan2epub-temp/"));
    assert!(submits[0].contains("?se="));
    assert_eq!(outcome.uploaded, 1);
    assert_eq!(outcome.released, 1);
    assert_eq!(store.live(), 0);
    assert_eq!(store.deleted().len(), 1);
}

#[tokio::test]
async fn oversized_scan_fails_before_any_service_call() {
    let dir = tempfile::tempdir().unwrap();
    let input = scan_file(&dir, 4096);
    let store = Arc::new(MemoryStore::default());
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));
    let config = PipelineConfig::builder().max_file_size_bytes(1024).build().unwrap();

    let err = assert_err!(
        run_ocr(
            input.to_str().unwrap(),
            &dir.path().join("raw.epub"),
            &backends(ocr.clone(), Some(store.clone())),
            &config,
        )
        .await
    );

    assert!(matches!(err, ScanError::FileTooLarge { size_bytes: 4096, limit_bytes: 1024, .. }));
    assert_eq!(err.kind(), ErrorKind::Input);
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    assert!(ocr.submits().is_empty());
    assert!(!dir.path().join("raw.epub").exists());
}

#[tokio::test]
async fn local_input_without_storage_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = scan_file(&dir, 16);
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));

    let err = run_ocr(
        input.to_str().unwrap(),
        &dir.path().join("raw.epub"),
        &backends(ocr.clone(), None),
        &config(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(ocr.submits().is_empty());
}

#[tokio::test]
async fn output_must_be_an_epub() {
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));
    let err = run_ocr(
        "https://example.com/a.pdf",
        Path::new("/tmp/out.txt"),
        &backends(ocr.clone(), None),
        &config(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ScanError::InvalidOutputPath { .. }));
    assert!(ocr.submits().is_empty());
}

// ── Teardown guarantees ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn handles_are_released_once_when_the_second_ocr_call_fails() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("part1.pdf");
    let second = dir.path().join("part2.pdf");
    std::fs::write(&first, b"one").unwrap();
    std::fs::write(&second, b"two").unwrap();

    let store = Arc::new(MemoryStore::default());
    let mut ocr = ScriptedOcr::succeeding(&["Page one."]);
    ocr.fail_submit_on = Some(2);
    let ocr = Arc::new(ocr);

    let manager = BlobLifecycleManager::new(store.clone(), StorageConfig::default());
    let orchestrator = OcrOrchestrator::new(ocr.clone(), config().ocr);
    let session = Session::new();

    let result = manager
        .with_session(&session, async {
            let a = manager.upload(&first, &session).await?;
            let b = manager.upload(&second, &session).await?;
            orchestrator.run(&a.access.url).await?;
            orchestrator.run(&b.access.url).await?;
            Ok::<_, ScanError>(())
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ocr);
    assert_eq!(ocr.submits().len(), 2);
    assert_eq!(session.created_count(), 2);
    assert_eq!(session.released_count(), 2);
    assert_eq!(session.live_count(), 0);
    assert_eq!(store.live(), 0);

    let mut deleted = store.deleted();
    deleted.sort();
    deleted.dedup();
    assert_eq!(deleted.len(), 2, "each handle deleted exactly once");
    assert_eq!(store.deleted().len(), 2);

    // A second teardown finds nothing to do.
    let summary = manager.release_all(&session).await;
    assert_eq!(summary.released, 0);
    assert_eq!(store.deleted().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_ocr_job_leaks_no_upload() {
    let dir = tempfile::tempdir().unwrap();
    let input = scan_file(&dir, 32);
    let output = dir.path().join("book.epub");
    let store = Arc::new(MemoryStore::default());
    let ocr = Arc::new(ScriptedOcr::new(vec![
        PollResponse::running(),
        PollResponse::failed("UnsupportedContent"),
    ]));
    let client = UppercaseClient::default();

    let err = run_full_pipeline(
        input.to_str().unwrap(),
        &output,
        &backends(ocr, Some(store.clone())),
        &client,
        &config(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ScanError::OcrJobFailed { .. }));
    assert!(err.to_string().contains("UnsupportedContent"));
    assert_eq!(store.live(), 0);
    assert_eq!(store.deleted().len(), 1);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert!(!output.exists());
}

// ── Cleanup and full pipeline ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_pipeline_cleans_every_chunk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let input = scan_file(&dir, 32);
    let output = dir.path().join("book.epub");
    let store = Arc::new(MemoryStore::default());
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));
    let client = UppercaseClient::default();

    let outcome = run_full_pipeline(
        input.to_str().unwrap(),
        &output,
        &backends(ocr, Some(store.clone())),
        &client,
        &config(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.ocr.polls, 3);
    assert_eq!(outcome.ocr.released, 1);
    assert!(outcome.interim_path.is_none());
    assert_eq!(outcome.cleanup.items, 1);
    assert_eq!(outcome.cleanup.total_chunks, 3);
    assert_eq!(outcome.cleanup.fallback_chunks, 0);
    assert!(!outcome.cleanup.degraded());
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.live(), 0);

    let doc = read_epub(&output).unwrap();
    assert_eq!(doc.metadata.title, "konyv (Cleaned)");
    let text = book_text(&output);
    assert!(text.contains("ELSŐ FEJEZET"));
    assert!(text.contains("EZ AZ ELSŐ BEKEZDÉS SZÖVEGE, AMELY EGY TELJES MONDAT."));
    assert!(text.find("ELSŐ FEJEZET") < text.find("A MÁSODIK OLDAL"));
}

#[tokio::test(start_paused = true)]
async fn save_interim_keeps_the_raw_ocr_epub() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let ocr = Arc::new(ScriptedOcr::succeeding(PAGES));
    let config = PipelineConfig::builder().save_interim(true).build().unwrap();

    let outcome = run_full_pipeline(
        "https://example.com/konyv.pdf",
        &output,
        &backends(ocr, None),
        &UppercaseClient::default(),
        &config,
    )
    .await
    .unwrap();

    let interim = outcome.interim_path.expect("interim EPUB path");
    assert!(interim.ends_with("konyv_interim_ocr.epub"));
    assert!(book_text(&interim).contains("amely egy teljes mondat."));
    assert!(book_text(&output).contains("AMELY EGY TELJES MONDAT."));
}

#[tokio::test]
async fn broken_completion_service_keeps_original_text() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("raw.epub");
    let output = dir.path().join("clean.epub");
    let body = "<p>Első bekezdés, egy mondat.</p>\n<p>Második bekezdés, szintén.</p>";
    let doc = EpubDocument {
        metadata: EpubMetadata::new("Könyv", "Szerző", "hu"),
        chapters: vec![EpubChapter::from_body("c1", "Egy", "c1.xhtml", body, "hu")],
    };
    write_epub(&doc, &input).unwrap();

    let client = BrokenClient::default();
    let config = PipelineConfig::builder()
        .max_retries(1)
        .retry_backoff_ms(1)
        .build()
        .unwrap();

    let stats = run_cleanup(&input, &output, &client, &config).await.unwrap();

    assert_eq!(stats.total_chunks, 2);
    assert_eq!(stats.fallback_chunks, 2);
    assert!(stats.degraded());
    // One first attempt plus one retry per chunk.
    assert_eq!(client.calls.load(Ordering::SeqCst), 4);

    let cleaned = read_epub(&output).unwrap();
    assert_eq!(cleaned.metadata.title, "Könyv (Cleaned)");
    assert_eq!(cleaned.metadata.author, "Szerző");
    let text = book_text(&output);
    assert!(text.contains("Első bekezdés, egy mondat."));
    assert!(text.contains("Második bekezdés, szintén."));
}

#[tokio::test]
async fn cleanup_of_missing_epub_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_cleanup(
        &dir.path().join("nope.epub"),
        &dir.path().join("out.epub"),
        &UppercaseClient::default(),
        &config(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ScanError::FileNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::Input);
}
