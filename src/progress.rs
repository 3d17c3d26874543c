//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline uploads, polls the OCR job, and cleans each chunk.
//!
//! The trait is `Send + Sync`: chunk events arrive from concurrently running
//! cleanup calls, so implementations must guard shared state themselves.
//!
//! # Example
//!
//! ```rust
//! use scan2epub::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     cleaned: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, index: usize, total: usize, used_fallback: bool) {
//!         let done = self.cleaned.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("chunk {}/{} ({} done, fallback={})", index + 1, total, done, used_fallback);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { cleaned: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

/// Coarse pipeline stage, reported through [`PipelineProgressCallback::on_stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Ocr,
    Extract,
    Cleanup,
    Assemble,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Upload => "upload",
            Stage::Ocr => "ocr",
            Stage::Extract => "extract",
            Stage::Cleanup => "cleanup",
            Stage::Assemble => "assemble",
            Stage::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Called by the pipeline as it moves through its stages.
///
/// All methods default to no-ops so callers only override what they need.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage is starting.
    fn on_stage(&self, stage: Stage) {
        let _ = stage;
    }

    /// A local file finished uploading to temporary storage.
    fn on_upload_complete(&self, remote_name: &str, size_bytes: u64) {
        let _ = (remote_name, size_bytes);
    }

    /// The OCR job was polled.
    ///
    /// # Arguments
    /// * `poll`   — 1-based poll number
    /// * `status` — status reported by the service, lower-case
    fn on_ocr_poll(&self, poll: u32, status: &str) {
        let _ = (poll, status);
    }

    /// Cleanup of one document item (chapter) is starting.
    fn on_item_start(&self, item: usize, total_items: usize, chunk_count: usize) {
        let _ = (item, total_items, chunk_count);
    }

    /// A completion request for a chunk is about to be sent.
    ///
    /// `index` is the 0-based sequence index within the current item.
    fn on_chunk_start(&self, index: usize, total: usize) {
        let _ = (index, total);
    }

    /// A chunk finished. `used_fallback` is true when its original text was
    /// kept because every attempt failed.
    fn on_chunk_complete(&self, index: usize, total: usize, used_fallback: bool) {
        let _ = (index, total, used_fallback);
    }

    /// The run finished and its output was written.
    fn on_complete(&self, chunks: usize, fallbacks: usize) {
        let _ = (chunks, fallbacks);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<Stage>>,
        polls: AtomicUsize,
        completes: AtomicUsize,
        fallbacks: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage(&self, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_ocr_poll(&self, _poll: u32, _status: &str) {
            self.polls.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_complete(&self, _index: usize, _total: usize, used_fallback: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if used_fallback {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage(Stage::Upload);
        cb.on_upload_complete("x.pdf", 10);
        cb.on_ocr_poll(1, "running");
        cb.on_item_start(0, 1, 3);
        cb.on_chunk_start(0, 3);
        cb.on_chunk_complete(0, 3, false);
        cb.on_complete(3, 0);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage(Stage::Ocr);
        tracker.on_ocr_poll(1, "running");
        tracker.on_ocr_poll(2, "succeeded");
        tracker.on_stage(Stage::Cleanup);
        tracker.on_chunk_complete(0, 2, false);
        tracker.on_chunk_complete(1, 2, true);

        assert_eq!(*tracker.stages.lock().unwrap(), vec![Stage::Ocr, Stage::Cleanup]);
        assert_eq!(tracker.polls.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.fallbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_display_is_lowercase() {
        assert_eq!(Stage::Teardown.to_string(), "teardown");
    }
}
