//! # scan2epub
//!
//! Turn scanned books into clean, reflowable EPUBs.
//!
//! ## Why this crate?
//!
//! OCR output from scanned books is full of noise: words hyphenated across
//! line ends, page numbers in the middle of sentences, hard line breaks every
//! sixty characters. This crate runs the scan through a remote OCR service,
//! then sends the text, chunk by chunk, to a completion model that repairs
//! exactly those artifacts, and packages the result as an EPUB.
//!
//! ## Pipeline Overview
//!
//! ```text
//! scan (local path or URL)
//!  │
//!  ├─ 1. Upload       local files go to temporary blob storage (session-scoped)
//!  ├─ 2. OCR          submit + poll the analysis job, with backoff and timeout
//!  ├─ 3. Teardown     every temporary upload is deleted, on every exit path
//!  ├─ 4. Extract      page markdown → content items
//!  ├─ 5. Chunk        paragraph → sentence → character boundaries
//!  ├─ 6. Clean        concurrent completion calls, retry, fallback to original
//!  ├─ 7. Reconstruct  headings vs paragraphs
//!  └─ 8. Assemble     EPUB 3 package
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scan2epub::pipeline::azure_blob::AzureBlobStore;
//! use scan2epub::pipeline::azure_cu::AzureContentUnderstanding;
//! use scan2epub::pipeline::llm::LlmCompletionClient;
//! use scan2epub::{run_full_pipeline, OcrBackends, PipelineConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http = reqwest::Client::new();
//!     let backends = OcrBackends {
//!         ocr: Arc::new(AzureContentUnderstanding::new(
//!             "https://my-resource.services.ai.azure.com",
//!             "<key>",
//!             http.clone(),
//!         )?),
//!         storage: Some(Arc::new(AzureBlobStore::from_connection_string(
//!             "AccountName=acct;AccountKey=a2V5;EndpointSuffix=core.windows.net",
//!             http,
//!         )?)),
//!     };
//!     let provider = edgequake_llm::ProviderFactory::create_llm_provider("openai", "gpt-4.1-mini")?;
//!     let client = LlmCompletionClient::new(provider, "openai/gpt-4.1-mini", 120);
//!
//!     let config = PipelineConfig::builder().language("hu").build()?;
//!     let outcome = run_full_pipeline("book.pdf", Path::new("book.epub"), &backends, &client, &config).await?;
//!     eprintln!(
//!         "{} chunks, {} kept original text",
//!         outcome.cleanup.total_chunks, outcome.cleanup.fallback_chunks
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scan2epub` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scan2epub = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod debug;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod preflight;
pub mod progress;
pub mod prompts;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CleanupConfig, OcrConfig, PipelineConfig, PipelineConfigBuilder, ProcessingConfig, StorageConfig,
};
pub use convert::{run_cleanup, run_full_pipeline, run_ocr, OcrBackends};
pub use error::{CompletionError, ErrorKind, ScanError};
pub use output::{CleanupStats, ItemReport, OcrOutcome, PipelineOutcome};
pub use preflight::{Preflight, PreflightReport, Service, ServiceCheck};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use session::{Session, TempResourceHandle};
