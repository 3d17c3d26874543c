//! Configuration types for the scan-to-EPUB pipeline.
//!
//! Every tunable lives in one [`PipelineConfig`] value that the caller builds
//! once and passes to each entry point. Library code never reads environment
//! variables or config files on its own: the CLI resolves those and hands the
//! result in. That keeps runs reproducible and lets tests inject exact values.
//!
//! The value can be produced three ways:
//! * [`PipelineConfig::default()`] — the documented defaults below,
//! * [`PipelineConfig::builder()`] — override individual knobs, validated on `build()`,
//! * [`PipelineConfig::load`] / [`PipelineConfig::from_toml_str`] — a TOML
//!   file with `[storage]`, `[ocr]`, `[cleanup]` and `[processing]` sections.

use crate::error::ScanError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use scan2epub::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_chunk_chars(3000)
///     .concurrency(2)
///     .language("en")
///     .build()
///     .unwrap();
/// assert_eq!(config.cleanup.max_chunk_chars, 3000);
/// ```
#[derive(Clone, Default)]
pub struct PipelineConfig {
    /// Temporary blob storage for local inputs.
    pub storage: StorageConfig,
    /// OCR job polling budget.
    pub ocr: OcrConfig,
    /// Chunking and completion-service cleanup.
    pub cleanup: CleanupConfig,
    /// Run-level toggles and EPUB metadata.
    pub processing: ProcessingConfig,
    /// Optional observer for stage, poll, and per-chunk events.
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("storage", &self.storage)
            .field("ocr", &self.ocr)
            .field("cleanup", &self.cleanup)
            .field("processing", &self.processing)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

/// Temporary remote storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Container that holds uploads for the duration of a session. Default: `scan2epub-temp`.
    pub container_name: String,

    /// Largest local file accepted for upload, in bytes. Default: 256 MiB.
    ///
    /// Checked against file metadata before any network call, so an oversized
    /// scan fails fast without touching the storage account.
    pub max_file_size_bytes: u64,

    /// Lifetime of the read-only access descriptor handed to the OCR service. Default: 1 h.
    pub access_ttl: Duration,

    /// Retries for a transient upload failure. Default: 3.
    pub upload_retries: u32,

    /// Initial upload retry delay in milliseconds (doubles each attempt). Default: 1000.
    pub retry_backoff_ms: u64,

    /// Log each deletion at `info` instead of `debug`. Default: true.
    pub log_cleanup: bool,

    /// Delete uploads when the run fails. Default: true.
    ///
    /// Setting this to `false` keeps the uploaded blobs of a *failed* run for
    /// post-mortem inspection; teardown still runs and logs every retained
    /// blob name. Successful runs always delete their uploads.
    pub cleanup_on_failure: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            container_name: "scan2epub-temp".to_string(),
            max_file_size_bytes: 256 * MIB,
            access_ttl: Duration::from_secs(3600),
            upload_retries: 3,
            retry_backoff_ms: 1000,
            log_cleanup: true,
            cleanup_on_failure: true,
        }
    }
}

/// OCR polling budget.
///
/// The orchestrator waits `poll_interval` after the first non-terminal
/// response, multiplies the delay by `backoff_factor` after each further one
/// (capped at `max_poll_interval`), and gives up once `max_wait` would be
/// exceeded or `max_polls` polls have been made, whichever comes first.
/// At least one of the two bounds must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// First delay between polls. Default: 2 s.
    pub poll_interval: Duration,
    /// Multiplier applied to the delay after each non-terminal poll. Default: 1.5.
    pub backoff_factor: f64,
    /// Upper bound for a single delay. Default: 15 s.
    pub max_poll_interval: Duration,
    /// Wall-clock budget for the whole job; `None` bounds by `max_polls`
    /// alone. Default: 10 min.
    pub max_wait: Option<Duration>,
    /// Optional hard cap on the number of polls. Default: unset.
    pub max_polls: Option<u32>,
    /// Consecutive transient poll failures tolerated before giving up. Default: 3.
    pub max_poll_errors: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff_factor: 1.5,
            max_poll_interval: Duration::from_secs(15),
            max_wait: Some(Duration::from_secs(600)),
            max_polls: None,
            max_poll_errors: 3,
        }
    }
}

/// Chunking and cleanup-call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Maximum characters per chunk. Default: 6000.
    ///
    /// Roughly 3000 tokens at a conservative two characters per token, which
    /// leaves room for the instruction template and a full-length response.
    pub max_chunk_chars: usize,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Cleanup is transcription repair, not writing; low temperature keeps
    /// the model from rephrasing.
    pub temperature: f32,

    /// Response length cap per chunk. Default: 4000.
    pub max_tokens: usize,

    /// Retries per chunk on a transient failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 2000.
    pub retry_backoff_ms: u64,

    /// Chunks cleaned concurrently. Default: 4.
    ///
    /// Chunks are independent; results are written back by sequence index so
    /// output order never depends on completion order. Use 1 for strictly
    /// sequential processing.
    pub concurrency: usize,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Paragraphs shorter than this with no sentence-final punctuation are
    /// rendered as headings. Default: 100.
    pub heading_max_chars: usize,

    /// Replacement for the built-in instruction template.
    pub system_prompt: Option<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 6000,
            temperature: 0.1,
            max_tokens: 4000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            concurrency: 4,
            api_timeout_secs: 120,
            heading_max_chars: 100,
            system_prompt: None,
        }
    }
}

/// Run-level toggles and output metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Write debug artifacts (OCR JSON, extracted text, per-chunk dumps). Default: false.
    pub debug: bool,
    /// Write per-item interim JSON and keep the interim OCR EPUB. Default: false.
    pub save_interim: bool,
    /// Where debug/interim artifacts go. Required for either to take effect.
    pub debug_dir: Option<PathBuf>,
    /// Language hint written into EPUB metadata. Default: `hu`.
    pub language: String,
    /// Author written into OCR-built EPUBs. Default: `Unknown`.
    pub author: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            save_interim: false,
            debug_dir: None,
            language: "hu".to_string(),
            author: "Unknown".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse a TOML configuration document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ScanError> {
        let file: ConfigFile = toml::from_str(s).map_err(|e| ScanError::ConfigFile {
            path: PathBuf::from("<inline>"),
            detail: e.to_string(),
        })?;
        file.into_config()
    }

    /// Load a TOML configuration file.
    ///
    /// A missing file is not an error: the defaults are returned, matching the
    /// behaviour users expect from an optional `scan2epub.toml` in the working
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ScanError::ConfigFile {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })
            }
        };
        let file: ConfigFile = toml::from_str(&text).map_err(|e| ScanError::ConfigFile {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        tracing::info!("Loaded configuration from {}", path.display());
        file.into_config()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.storage.container_name.trim().is_empty() {
            return Err(ScanError::InvalidConfig(
                "storage container name must not be empty".into(),
            ));
        }
        if self.storage.max_file_size_bytes == 0 {
            return Err(ScanError::InvalidConfig(
                "max file size must be > 0".into(),
            ));
        }
        if self.storage.access_ttl.is_zero() {
            return Err(ScanError::InvalidConfig(
                "access descriptor TTL must be > 0".into(),
            ));
        }
        if self.ocr.max_wait.is_none_or(|d| d.is_zero()) && self.ocr.max_polls.is_none() {
            return Err(ScanError::InvalidConfig(
                "OCR needs a wall-clock budget or a poll cap".into(),
            ));
        }
        if self.ocr.max_polls == Some(0) {
            return Err(ScanError::InvalidConfig(
                "OCR poll cap must be > 0".into(),
            ));
        }
        if self.ocr.poll_interval.is_zero() {
            return Err(ScanError::InvalidConfig(
                "OCR poll interval must be > 0".into(),
            ));
        }
        if !self.ocr.backoff_factor.is_finite() || self.ocr.backoff_factor < 1.0 {
            return Err(ScanError::InvalidConfig(format!(
                "OCR backoff factor must be a finite number ≥ 1.0, got {}",
                self.ocr.backoff_factor
            )));
        }
        if self.cleanup.max_chunk_chars == 0 {
            return Err(ScanError::InvalidConfig(
                "max chunk size must be > 0 characters".into(),
            ));
        }
        if self.cleanup.concurrency == 0 {
            return Err(ScanError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        Ok(())
    }

    /// Directory for debug artifacts, if debug mode is on and one was given.
    pub fn debug_dir(&self) -> Option<&Path> {
        if self.processing.debug {
            self.processing.debug_dir.as_deref()
        } else {
            None
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.config.storage.container_name = name.into();
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.config.storage.max_file_size_bytes = bytes;
        self
    }

    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.config.storage.access_ttl = ttl;
        self
    }

    pub fn upload_retries(mut self, n: u32) -> Self {
        self.config.storage.upload_retries = n;
        self
    }

    pub fn cleanup_on_failure(mut self, v: bool) -> Self {
        self.config.storage.cleanup_on_failure = v;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.ocr.poll_interval = d;
        self
    }

    pub fn backoff_factor(mut self, f: f64) -> Self {
        self.config.ocr.backoff_factor = f;
        self
    }

    pub fn max_poll_interval(mut self, d: Duration) -> Self {
        self.config.ocr.max_poll_interval = d;
        self
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.config.ocr.max_wait = Some(d);
        self
    }

    /// Drop the wall-clock budget; the job is then bounded by `max_polls`.
    pub fn no_max_wait(mut self) -> Self {
        self.config.ocr.max_wait = None;
        self
    }

    pub fn max_polls(mut self, n: u32) -> Self {
        self.config.ocr.max_polls = Some(n);
        self
    }

    pub fn max_chunk_chars(mut self, n: usize) -> Self {
        self.config.cleanup.max_chunk_chars = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.cleanup.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.cleanup.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.cleanup.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.cleanup.retry_backoff_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.cleanup.concurrency = n.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.cleanup.api_timeout_secs = secs;
        self
    }

    pub fn heading_max_chars(mut self, n: usize) -> Self {
        self.config.cleanup.heading_max_chars = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.cleanup.system_prompt = Some(prompt.into());
        self
    }

    pub fn debug(mut self, v: bool) -> Self {
        self.config.processing.debug = v;
        self
    }

    pub fn save_interim(mut self, v: bool) -> Self {
        self.config.processing.save_interim = v;
        self
    }

    pub fn debug_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.processing.debug_dir = Some(dir.into());
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.processing.language = lang.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.config.processing.author = author.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ScanError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Config file ──────────────────────────────────────────────────────────

/// On-disk representation. Human-friendly units (MB, hours, ms) are converted
/// into the typed config by [`ConfigFile::into_config`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    storage: StorageSection,
    ocr: OcrSection,
    cleanup: CleanupSection,
    processing: ProcessingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StorageSection {
    container_name: Option<String>,
    max_file_size_mb: Option<u64>,
    access_ttl_hours: Option<u64>,
    upload_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    log_cleanup: Option<bool>,
    cleanup_on_failure: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OcrSection {
    poll_interval_ms: Option<u64>,
    backoff_factor: Option<f64>,
    max_poll_interval_ms: Option<u64>,
    max_wait_secs: Option<u64>,
    max_polls: Option<u32>,
    max_poll_errors: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CleanupSection {
    max_chunk_chars: Option<usize>,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    concurrency: Option<usize>,
    api_timeout_secs: Option<u64>,
    heading_max_chars: Option<usize>,
    system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProcessingSection {
    debug: Option<bool>,
    save_interim: Option<bool>,
    language: Option<String>,
    author: Option<String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<PipelineConfig, ScanError> {
        let mut c = PipelineConfig::default();

        let s = self.storage;
        if let Some(v) = s.container_name {
            c.storage.container_name = v;
        }
        if let Some(v) = s.max_file_size_mb {
            c.storage.max_file_size_bytes = v.saturating_mul(MIB);
        }
        if let Some(v) = s.access_ttl_hours {
            c.storage.access_ttl = Duration::from_secs(v.saturating_mul(3600));
        }
        if let Some(v) = s.upload_retries {
            c.storage.upload_retries = v;
        }
        if let Some(v) = s.retry_backoff_ms {
            c.storage.retry_backoff_ms = v;
        }
        if let Some(v) = s.log_cleanup {
            c.storage.log_cleanup = v;
        }
        if let Some(v) = s.cleanup_on_failure {
            c.storage.cleanup_on_failure = v;
        }

        let o = self.ocr;
        if let Some(v) = o.poll_interval_ms {
            c.ocr.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = o.backoff_factor {
            c.ocr.backoff_factor = v;
        }
        if let Some(v) = o.max_poll_interval_ms {
            c.ocr.max_poll_interval = Duration::from_millis(v);
        }
        // 0 removes the wall-clock budget.
        if let Some(v) = o.max_wait_secs {
            c.ocr.max_wait = (v > 0).then(|| Duration::from_secs(v));
        }
        if o.max_polls.is_some() {
            c.ocr.max_polls = o.max_polls;
        }
        if let Some(v) = o.max_poll_errors {
            c.ocr.max_poll_errors = v;
        }

        let k = self.cleanup;
        if let Some(v) = k.max_chunk_chars {
            c.cleanup.max_chunk_chars = v;
        }
        if let Some(v) = k.temperature {
            c.cleanup.temperature = v.clamp(0.0, 2.0);
        }
        if let Some(v) = k.max_tokens {
            c.cleanup.max_tokens = v;
        }
        if let Some(v) = k.max_retries {
            c.cleanup.max_retries = v;
        }
        if let Some(v) = k.retry_backoff_ms {
            c.cleanup.retry_backoff_ms = v;
        }
        if let Some(v) = k.concurrency {
            c.cleanup.concurrency = v;
        }
        if let Some(v) = k.api_timeout_secs {
            c.cleanup.api_timeout_secs = v;
        }
        if let Some(v) = k.heading_max_chars {
            c.cleanup.heading_max_chars = v;
        }
        if k.system_prompt.is_some() {
            c.cleanup.system_prompt = k.system_prompt;
        }

        let p = self.processing;
        if let Some(v) = p.debug {
            c.processing.debug = v;
        }
        if let Some(v) = p.save_interim {
            c.processing.save_interim = v;
        }
        if let Some(v) = p.language {
            c.processing.language = v;
        }
        if let Some(v) = p.author {
            c.processing.author = v;
        }

        c.validate()?;
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.storage.container_name, "scan2epub-temp");
        assert_eq!(c.storage.max_file_size_bytes, 256 * MIB);
        assert_eq!(c.storage.access_ttl, Duration::from_secs(3600));
        assert!(c.storage.cleanup_on_failure);
        assert_eq!(c.cleanup.max_chunk_chars, 6000);
        assert_eq!(c.cleanup.max_retries, 3);
        assert_eq!(c.processing.language, "hu");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn builder_rejects_zero_chunk_size() {
        let err = PipelineConfig::builder().max_chunk_chars(0).build().unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = PipelineConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.cleanup.concurrency, 1);
    }

    #[test]
    fn toml_overrides_and_keeps_defaults() {
        let toml = r#"
            [storage]
            max_file_size_mb = 10
            access_ttl_hours = 2

            [ocr]
            poll_interval_ms = 500
            max_polls = 20

            [cleanup]
            max_chunk_chars = 3000

            [processing]
            language = "en"
        "#;
        let c = PipelineConfig::from_toml_str(toml).unwrap();
        assert_eq!(c.storage.max_file_size_bytes, 10 * MIB);
        assert_eq!(c.storage.access_ttl, Duration::from_secs(7200));
        assert_eq!(c.storage.container_name, "scan2epub-temp");
        assert_eq!(c.ocr.poll_interval, Duration::from_millis(500));
        assert_eq!(c.ocr.max_polls, Some(20));
        assert_eq!(c.cleanup.max_chunk_chars, 3000);
        assert_eq!(c.cleanup.temperature, 0.1);
        assert_eq!(c.processing.language, "en");
    }

    #[test]
    fn toml_unknown_key_is_config_error() {
        let err = PipelineConfig::from_toml_str("[storage]\nmax_size = 3\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn toml_invalid_value_fails_validation() {
        let err = PipelineConfig::from_toml_str("[cleanup]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn zero_max_wait_means_poll_cap_only() {
        let c = PipelineConfig::from_toml_str("[ocr]\nmax_wait_secs = 0\nmax_polls = 10\n").unwrap();
        assert_eq!(c.ocr.max_wait, None);
        assert_eq!(c.ocr.max_polls, Some(10));

        let err = PipelineConfig::from_toml_str("[ocr]\nmax_wait_secs = 0\n").unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn non_finite_backoff_factor_is_rejected() {
        for value in ["nan", "inf", "0.5"] {
            let toml = format!("[ocr]\nbackoff_factor = {value}\n");
            let err = PipelineConfig::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, ScanError::InvalidConfig(_)), "{value}");
        }
        let err = PipelineConfig::builder()
            .backoff_factor(f64::INFINITY)
            .build()
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = PipelineConfig::from_toml_str("[ocr]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
        let err = PipelineConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = PipelineConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(c.cleanup.max_chunk_chars, 6000);
    }

    #[test]
    fn debug_dir_requires_debug_flag() {
        let c = PipelineConfig::builder().debug_dir("/tmp/x").build().unwrap();
        assert!(c.debug_dir().is_none());
        let c = PipelineConfig::builder()
            .debug(true)
            .debug_dir("/tmp/x")
            .build()
            .unwrap();
        assert_eq!(c.debug_dir(), Some(Path::new("/tmp/x")));
    }
}
