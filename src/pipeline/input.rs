//! Input resolution: classify a user-supplied string as a remote locator or
//! a local file.
//!
//! Remote locators (`http://`, `https://`) are handed to the OCR service as-is
//! and need no temporary upload. Local paths are checked for existence and
//! read permission up front so the user gets an input error instead of a
//! storage error halfway through the run.

use crate::error::ScanError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Remotely fetchable locator, used directly.
    Remote(String),
    /// Local file that must be uploaded to temporary storage first.
    Local(PathBuf),
}

impl InputSource {
    /// File name without extension, used as the default document title.
    pub fn stem(&self) -> String {
        let name = match self {
            InputSource::Local(p) => p
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string),
            InputSource::Remote(url) => url_file_name(url),
        };
        name.as_deref()
            .map(|n| Path::new(n).file_stem().and_then(|s| s.to_str()).unwrap_or(n).to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Classify `input`, validating local files.
pub fn resolve_input(input: &str) -> Result<InputSource, ScanError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScanError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        reqwest::Url::parse(input).map_err(|_| ScanError::InvalidInput {
            input: input.to_string(),
        })?;
        debug!("Using remote input: {}", input);
        return Ok(InputSource::Remote(input.to_string()));
    }
    resolve_local(Path::new(input)).map(InputSource::Local)
}

/// Validate that a local path exists, is a file, and is readable.
pub fn resolve_local(path: &Path) -> Result<PathBuf, ScanError> {
    let path = path.to_path_buf();
    if !path.exists() {
        return Err(ScanError::FileNotFound { path });
    }
    if !path.is_file() {
        return Err(ScanError::InvalidInput {
            input: path.display().to_string(),
        });
    }
    match std::fs::File::open(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ScanError::PermissionDenied { path });
        }
        Err(_) => return Err(ScanError::FileNotFound { path }),
    }
    debug!("Resolved local input: {}", path.display());
    Ok(path)
}

/// Last path segment of a URL, if it looks like a file name.
fn url_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}
