//! Result types returned by the pipeline entry points.
//!
//! Everything here is `Serialize` so the CLI can emit it with `--json` and
//! library callers can persist run statistics.

use crate::pipeline::artifacts::ArtifactReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of the OCR phase (`run_ocr`, or the first half of `run_full_pipeline`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutcome {
    /// Remote job identifier reported by the OCR service.
    pub job_id: String,
    /// Number of status polls made, including the terminal one.
    pub polls: u32,
    /// Number of backoff sleeps between polls.
    pub sleeps: u32,
    /// Pages (content entries) returned by the service.
    pub pages: usize,
    /// Characters of extracted text.
    pub text_chars: usize,
    /// Temporary blobs uploaded for this run.
    pub uploaded: usize,
    /// Temporary blobs deleted at teardown.
    pub released: usize,
    /// Wall-clock time spent waiting on the OCR job.
    pub duration_ms: u64,
    /// Where the EPUB was written, when one was written.
    pub output_path: Option<PathBuf>,
}

/// Per-item (chapter) cleanup summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    /// Stable item identifier carried from extraction to assembly.
    pub id: String,
    pub title: String,
    pub chunks: usize,
    pub forced_chunks: usize,
    pub fallbacks: usize,
    pub original_chars: usize,
    pub cleaned_chars: usize,
    /// Noise detected in the text before cleanup.
    pub artifacts: ArtifactReport,
}

/// Aggregate statistics for the cleanup phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Content items read from the source document.
    pub items: usize,
    /// Items skipped because they carried no text.
    pub skipped_items: usize,
    pub total_chunks: usize,
    /// Chunks produced by a raw character split.
    pub forced_chunks: usize,
    /// Chunks whose original text was kept after every attempt failed.
    pub fallback_chunks: usize,
    /// Completion attempts across all chunks, retries included.
    pub total_attempts: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Total noise detected before cleanup, summed over items.
    pub artifacts: ArtifactReport,
    pub llm_duration_ms: u64,
    pub total_duration_ms: u64,
    pub per_item: Vec<ItemReport>,
}

impl CleanupStats {
    /// True when at least one chunk fell back to its original text.
    pub fn degraded(&self) -> bool {
        self.fallback_chunks > 0
    }
}

/// Result of a full run (`run_full_pipeline`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub ocr: OcrOutcome,
    pub cleanup: CleanupStats,
    pub output_path: PathBuf,
    /// Interim OCR-only EPUB, when one was kept.
    pub interim_path: Option<PathBuf>,
    pub total_duration_ms: u64,
}
