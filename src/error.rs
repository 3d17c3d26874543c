//! Error types for the scan2epub library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ScanError`] — **Fatal**: the run cannot proceed (bad configuration,
//!   unreadable or oversized input, storage unreachable, OCR job failed or
//!   timed out, EPUB could not be written). Returned as `Err(ScanError)` from
//!   the `run_*` entry points, always *after* session teardown has run.
//!
//! * [`CompletionError`] — **Recoverable**: one chunk's cleanup call failed.
//!   The cleanup engine retries transient failures and then falls back to the
//!   original chunk text; the error never crosses the engine boundary and is
//!   only recorded inside [`crate::pipeline::llm::CleanupResult`].
//!
//! Every [`ScanError`] maps to an [`ErrorKind`] so front-ends can tell the user
//! whether to fix their configuration, retry later, or look at the input.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the scan2epub library.
#[derive(Debug, Error)]
pub enum ScanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is neither a readable path nor an HTTP/HTTPS URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// Local file exceeds the configured upload limit. Raised before any
    /// network call is attempted.
    #[error("File too large: '{path}' is {size_bytes} bytes, limit is {limit_bytes} bytes\nRaise [storage] max_file_size_mb or split the scan.")]
    FileTooLarge {
        path: PathBuf,
        size_bytes: u64,
        limit_bytes: u64,
    },

    /// The requested output path is unusable (wrong extension, etc.).
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// An EPUB given as input could not be read.
    #[error("Failed to read EPUB '{path}': {detail}")]
    EpubRead { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required setting (endpoint, credential, …) is missing.
    #[error("Missing required setting '{name}'.\n{hint}")]
    MissingSetting { name: String, hint: String },

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration file '{path}': {detail}")]
    ConfigFile { path: PathBuf, detail: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// A blob storage request failed (upload, container bootstrap, delete).
    #[error("Storage {operation} failed: {detail}")]
    Storage {
        operation: String,
        detail: String,
        retryable: bool,
    },

    /// A read-only access descriptor could not be generated.
    #[error("Failed to issue access descriptor for '{name}': {detail}")]
    AccessDescriptor { name: String, detail: String },

    // ── OCR errors ────────────────────────────────────────────────────────
    /// The OCR service rejected or failed the request at the transport level.
    #[error("OCR request failed: {detail}")]
    OcrRequest { detail: String, retryable: bool },

    /// The remote analysis job reached its `Failed` terminal state.
    #[error("OCR job '{job_id}' failed: {detail}")]
    OcrJobFailed { job_id: String, detail: String },

    /// The job did not reach a terminal state within the poll budget.
    #[error("OCR job '{job_id}' timed out after {elapsed_secs}s ({polls} polls)")]
    OcrTimedOut {
        job_id: String,
        elapsed_secs: u64,
        polls: u32,
    },

    /// The OCR service reported a status this client does not understand.
    #[error("OCR job '{job_id}' returned unexpected status '{status}'")]
    OcrUnexpectedStatus { job_id: String, status: String },

    // ── Assembly errors ───────────────────────────────────────────────────
    /// Writing the output EPUB failed.
    #[error("Failed to assemble EPUB '{path}': {detail}")]
    Assembly { path: PathBuf, detail: String },

    /// Every content item was empty; there is nothing to package.
    #[error("No content found to create EPUB. All chapters appear to be empty.")]
    NoContent,

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ScanError`] for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    /// Missing or invalid setting — fix before retrying.
    Configuration,
    /// Problem with the input or output file itself.
    Input,
    /// Temporary storage problem.
    Storage,
    /// Remote OCR problem.
    Ocr,
    /// Final packaging failed.
    Assembly,
    /// Bug or environment problem.
    Internal,
}

impl ErrorKind {
    /// One-line advice shown under the error message.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "Configuration problem: fix the setting before retrying.",
            ErrorKind::Input => "Input problem: check the input file (size, format, permissions).",
            ErrorKind::Storage | ErrorKind::Ocr => {
                "Service problem: this may be transient; retrying may succeed."
            }
            ErrorKind::Assembly => "Output problem: check the output path and free disk space.",
            ErrorKind::Internal => "Internal error: please report this with --debug output.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Input => "input",
            ErrorKind::Storage => "storage",
            ErrorKind::Ocr => "ocr",
            ErrorKind::Assembly => "assembly",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ScanError {
    /// Which failure category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::FileNotFound { .. }
            | ScanError::PermissionDenied { .. }
            | ScanError::InvalidInput { .. }
            | ScanError::FileTooLarge { .. }
            | ScanError::InvalidOutputPath { .. }
            | ScanError::EpubRead { .. } => ErrorKind::Input,

            ScanError::InvalidConfig(_)
            | ScanError::MissingSetting { .. }
            | ScanError::ConfigFile { .. } => ErrorKind::Configuration,

            ScanError::Storage { .. } | ScanError::AccessDescriptor { .. } => ErrorKind::Storage,

            ScanError::OcrRequest { .. }
            | ScanError::OcrJobFailed { .. }
            | ScanError::OcrTimedOut { .. }
            | ScanError::OcrUnexpectedStatus { .. } => ErrorKind::Ocr,

            ScanError::Assembly { .. }
            | ScanError::NoContent
            | ScanError::OutputWriteFailed { .. } => ErrorKind::Assembly,

            ScanError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` when repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Storage { retryable, .. } => *retryable,
            ScanError::OcrRequest { retryable, .. } => *retryable,
            ScanError::OcrTimedOut { .. } => true,
            _ => false,
        }
    }

    /// Build a storage error from an HTTP status, classifying 408/429/5xx as transient.
    pub fn storage_status(operation: &str, status: u16, body: &str) -> Self {
        ScanError::Storage {
            operation: operation.to_string(),
            detail: format!("HTTP {status}: {}", truncate(body, 300)),
            retryable: is_transient_status(status),
        }
    }

    /// Build an OCR transport error from an HTTP status.
    pub fn ocr_status(status: u16, body: &str) -> Self {
        ScanError::OcrRequest {
            detail: format!("HTTP {status}: {}", truncate(body, 300)),
            retryable: is_transient_status(status),
        }
    }
}

/// HTTP statuses worth retrying: request timeout, throttling, server errors.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// A failed call to the completion service for one chunk.
///
/// Carries the retryable/non-retryable classification the cleanup engine
/// uses to decide between backing off and falling back immediately.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct CompletionError {
    pub message: String,
    pub retryable: bool,
}

impl CompletionError {
    /// A failure that may succeed on retry (network, 429, 5xx, timeout).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed on retry (bad key, bad request, filtered).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A standalone 401/403 status code; digits of longer numbers do not count.
static RE_AUTH_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b40[13]\b").unwrap());

/// Classify a provider error message into transient or permanent.
///
/// Providers surface failures as free text, so the rules are substring based.
/// Unknown failures are treated as transient: retrying first and falling back
/// later costs a few seconds, while giving up early loses a cleaned chunk.
pub fn classify_completion_error(message: &str) -> CompletionError {
    let lower = message.to_ascii_lowercase();

    if RE_AUTH_STATUS.is_match(&lower) {
        return CompletionError::permanent(message);
    }
    let permanent = [
        "unauthorized",
        "forbidden",
        "invalid api key",
        "invalid_api_key",
        "authentication",
        "content_filter",
        "content filter",
        "400 bad request",
        "invalid request",
        "deploymentnotfound",
        "model not found",
    ];
    if permanent.iter().any(|p| lower.contains(p)) {
        return CompletionError::permanent(message);
    }

    CompletionError::transient(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_too_large_display() {
        let e = ScanError::FileTooLarge {
            path: "book.pdf".into(),
            size_bytes: 300,
            limit_bytes: 200,
        };
        let msg = e.to_string();
        assert!(msg.contains("300 bytes"), "got: {msg}");
        assert_eq!(e.kind(), ErrorKind::Input);
        assert!(!e.is_retryable());
    }

    #[test]
    fn ocr_timeout_is_retryable() {
        let e = ScanError::OcrTimedOut {
            job_id: "job-1".into(),
            elapsed_secs: 600,
            polls: 42,
        };
        assert!(e.to_string().contains("600s"));
        assert!(e.to_string().contains("42 polls"));
        assert_eq!(e.kind(), ErrorKind::Ocr);
        assert!(e.is_retryable());
    }

    #[test]
    fn storage_status_classification() {
        assert!(ScanError::storage_status("upload", 503, "busy").is_retryable());
        assert!(ScanError::storage_status("upload", 429, "slow down").is_retryable());
        assert!(!ScanError::storage_status("upload", 403, "bad signature").is_retryable());
    }

    #[test]
    fn config_errors_have_configuration_kind() {
        let e = ScanError::MissingSetting {
            name: "AZURE_CU_ENDPOINT".into(),
            hint: "set it".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Configuration);
        assert!(e.kind().hint().contains("fix the setting"));
    }

    #[test]
    fn classify_rate_limit_as_transient() {
        let e = classify_completion_error("HTTP 429 Too Many Requests: rate limit exceeded");
        assert!(e.retryable);
    }

    #[test]
    fn classify_auth_as_permanent() {
        let e = classify_completion_error("API error: 401 Unauthorized");
        assert!(!e.retryable);
        let e = classify_completion_error("finish_reason=content_filter");
        assert!(!e.retryable);
    }

    #[test]
    fn status_codes_only_match_as_whole_numbers() {
        assert!(classify_completion_error("upstream took 4013ms, retry later").retryable);
        assert!(classify_completion_error("request timed out after 4013ms").retryable);
        assert!(classify_completion_error("queue position 14030").retryable);
        assert!(!classify_completion_error("status 403: quota key revoked").retryable);
        assert!(!classify_completion_error("HTTP/1.1 401").retryable);
    }

    #[test]
    fn classify_unknown_as_transient() {
        assert!(classify_completion_error("something odd happened").retryable);
    }

    #[test]
    fn truncate_is_char_safe() {
        let s = "árvíztűrő tükörfúrógép";
        let t = truncate(s, 5);
        assert!(t.starts_with("árvíz"));
        assert!(t.ends_with('…'));
    }
}
