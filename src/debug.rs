//! Optional on-disk artifacts for inspecting a run.
//!
//! Nothing here is required for a run to succeed: every write failure is
//! logged at `warn` and swallowed.
//!
//! Layout under the artifact directory:
//!
//! ```text
//! ocr_result.json                         raw OCR payload          (debug)
//! extracted_text.txt                      joined OCR text          (debug)
//! <item>_original.txt                     text before cleanup      (debug)
//! llm_requests_responses/item_NNN/
//!     chunk_{i}_attempt_{a}_request.json                           (debug)
//!     chunk_{i}_attempt_{a}_response.json                          (debug)
//! interim/<item>.json                     per-item cleanup result  (save_interim)
//! <stem>_interim_ocr.epub                 OCR-only EPUB            (pipeline mode)
//! ```

use crate::config::ProcessingConfig;
use crate::error::CompletionError;
use crate::pipeline::artifacts::ArtifactReport;
use crate::pipeline::llm::{Completion, CompletionRequest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-item interim record written when `save_interim` is on.
#[derive(Debug, Serialize)]
pub struct InterimItem<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub original_text: &'a str,
    pub cleaned_text: &'a str,
    pub markup: &'a str,
    pub chunks: usize,
    pub fallbacks: usize,
    pub artifacts: ArtifactReport,
}

/// Writer for debug and interim artifacts.
#[derive(Debug, Clone)]
pub struct DebugArtifacts {
    dir: PathBuf,
    llm_dir: PathBuf,
    debug: bool,
    interim: bool,
}

impl DebugArtifacts {
    /// Set up the artifact directory for a run writing `output`.
    ///
    /// Returns `None` when neither debug nor save-interim is on, or when the
    /// directory cannot be created. The directory is
    /// `<debug_dir or output dir>/<output stem>`, with `_1`, `_2`, … appended
    /// when that name is taken.
    pub fn for_run(processing: &ProcessingConfig, output: &Path) -> Option<Self> {
        if !processing.debug && !processing.save_interim {
            return None;
        }
        let base = processing
            .debug_dir
            .clone()
            .or_else(|| output.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = file_stem(output);
        let dir = unique_dir(&base, &stem);

        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Cannot create artifact directory {}: {}", dir.display(), e);
            return None;
        }
        info!("Writing run artifacts to {}", dir.display());
        Some(Self {
            llm_dir: dir.join("llm_requests_responses"),
            dir,
            debug: processing.debug,
            interim: processing.save_interim,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// A view whose request/response dumps go under `item_NNN/`.
    pub fn for_item(&self, item: usize) -> Self {
        Self {
            llm_dir: self.dir.join("llm_requests_responses").join(format!("item_{item:03}")),
            ..self.clone()
        }
    }

    /// Path of the OCR-only EPUB kept next to the other artifacts.
    pub fn interim_epub_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}_interim_ocr.epub"))
    }

    pub fn write_ocr_result(&self, raw: &serde_json::Value) {
        if self.debug {
            self.write_json(&self.dir.join("ocr_result.json"), raw);
        }
    }

    pub fn write_extracted_text(&self, text: &str) {
        if self.debug {
            self.write_text(&self.dir.join("extracted_text.txt"), text);
        }
    }

    pub fn write_original_item(&self, item_id: &str, text: &str) {
        if self.debug {
            self.write_text(&self.dir.join(format!("{}_original.txt", safe_name(item_id))), text);
        }
    }

    pub fn record_request(&self, chunk: usize, attempt: u32, request: &CompletionRequest) {
        if self.debug {
            let path = self.llm_dir.join(format!("chunk_{chunk}_attempt_{attempt}_request.json"));
            self.write_json(&path, request);
        }
    }

    pub fn record_response(
        &self,
        chunk: usize,
        attempt: u32,
        outcome: &Result<Completion, CompletionError>,
    ) {
        if !self.debug {
            return;
        }
        let path = self.llm_dir.join(format!("chunk_{chunk}_attempt_{attempt}_response.json"));
        let value = match outcome {
            Ok(c) => serde_json::json!({ "ok": c }),
            Err(e) => serde_json::json!({ "error": e }),
        };
        self.write_json(&path, &value);
    }

    pub fn save_interim_item(&self, item: &InterimItem<'_>) {
        if self.interim {
            let path = self.dir.join("interim").join(format!("{}.json", safe_name(item.id)));
            self.write_json(&path, item);
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(s) => self.write_text(path, &s),
            Err(e) => warn!("Cannot serialise artifact {}: {}", path.display(), e),
        }
    }

    fn write_text(&self, path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create {}: {}", parent.display(), e);
                return;
            }
        }
        match std::fs::write(path, text) {
            Ok(()) => debug!("Wrote {}", path.display()),
            Err(e) => warn!("Cannot write artifact {}: {}", path.display(), e),
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("output")
        .to_string()
}

/// `<base>/<stem>`, or the first free `<base>/<stem>_N`.
fn unique_dir(base: &Path, stem: &str) -> PathBuf {
    let candidate = base.join(stem);
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| base.join(format!("{stem}_{n}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn safe_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
