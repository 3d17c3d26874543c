//! OCR noise diagnostics and completion-output normalisation.
//!
//! [`analyze`] counts the artifact patterns typical of scanned text. The
//! report is diagnostic only: it is logged and included in the run
//! statistics, and nothing downstream changes behaviour based on it.
//!
//! [`normalise_completion`] applies deterministic cleanup rules to whatever
//! the completion service returns, so model quirks (fences, CRLF, zero-width
//! characters) never reach the reconstructor.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Lines shorter than this (after trimming) count as short lines.
const SHORT_LINE_CHARS: usize = 30;

/// Counts of detected OCR-noise patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    /// Runs of two or more consecutive blank lines.
    pub excessive_line_breaks: usize,
    /// Words split by a hyphen at a line end (`szó-\ntag`).
    pub hyphenated_words: usize,
    /// One-line paragraphs, typical of broken page layout.
    pub single_line_paragraphs: usize,
    /// Lines consisting only of a number.
    pub page_numbers: usize,
    /// Non-empty lines shorter than 30 characters.
    pub short_lines: usize,
}

impl ArtifactReport {
    pub fn total(&self) -> usize {
        self.excessive_line_breaks
            + self.hyphenated_words
            + self.single_line_paragraphs
            + self.page_numbers
            + self.short_lines
    }
}

impl AddAssign for ArtifactReport {
    fn add_assign(&mut self, rhs: Self) {
        self.excessive_line_breaks += rhs.excessive_line_breaks;
        self.hyphenated_words += rhs.hyphenated_words;
        self.single_line_paragraphs += rhs.single_line_paragraphs;
        self.page_numbers += rhs.page_numbers;
        self.short_lines += rhs.short_lines;
    }
}

static RE_EXCESS_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n").unwrap());
static RE_HYPHENATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+-\s*\n\s*\w+").unwrap());
static RE_SINGLE_LINE_PARA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\S[^\n]*\n\s*\n").unwrap());
static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\d+\s*\n").unwrap());

/// Count OCR artifacts in `text`.
pub fn analyze(text: &str) -> ArtifactReport {
    ArtifactReport {
        excessive_line_breaks: RE_EXCESS_BREAKS.find_iter(text).count(),
        hyphenated_words: RE_HYPHENATED.find_iter(text).count(),
        single_line_paragraphs: RE_SINGLE_LINE_PARA.find_iter(text).count(),
        page_numbers: RE_PAGE_NUMBER.find_iter(text).count(),
        short_lines: text
            .split('\n')
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.chars().count() < SHORT_LINE_CHARS)
            .count(),
    }
}

/// Clean up a completion response before it is used as chapter text.
///
/// Rules, in order:
/// 1. Strip an outer code fence (` ``` `, ` ```text `, ` ```markdown `)
/// 2. Normalise line endings (CRLF / CR → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse runs of blank lines to a single blank line
/// 5. Strip invisible Unicode (zero-width spaces, BOM, word joiner)
/// 6. Trim the whole text
pub fn normalise_completion(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Strip outer fence ────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse blank-line runs ─────────────────────────────────────────

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

// ── Rule 5: Remove invisible Unicode ─────────────────────────────────────────

// Soft hyphen (U+00AD) is kept: in Hungarian text it can be a legitimate
// hyphenation hint, and the reconstructor escapes it safely.
fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_typical_scan_noise() {
        let text = "Az első sor egy hosszú mondat, ami folytató-\ndik a következő sorban.\n\n\n\n12\nRövid\n\nEgy bekezdés.\n\nVége";
        let r = analyze(text);
        assert_eq!(r.hyphenated_words, 1);
        assert!(r.excessive_line_breaks >= 1);
        assert_eq!(r.page_numbers, 1);
        assert!(r.short_lines >= 3);
        assert!(r.total() > 0);
    }

    #[test]
    fn clean_text_has_no_artifacts() {
        let r = analyze("A single well-formed paragraph that is long enough to not count as short.");
        assert_eq!(r, ArtifactReport::default());
    }

    #[test]
    fn reports_accumulate() {
        let mut a = ArtifactReport {
            page_numbers: 2,
            ..Default::default()
        };
        a += ArtifactReport {
            page_numbers: 1,
            short_lines: 4,
            ..Default::default()
        };
        assert_eq!(a.page_numbers, 3);
        assert_eq!(a.total(), 7);
    }

    #[test]
    fn strips_fences_with_any_language_tag() {
        assert_eq!(strip_outer_fence("```text\nhello\nworld\n```"), "hello\nworld");
        assert_eq!(strip_outer_fence("```\nhello\n```\n"), "hello");
        assert_eq!(strip_outer_fence("no fence"), "no fence");
    }

    #[test]
    fn normalise_full_pass() {
        let input = "```markdown\r\nFirst para.  \r\n\r\n\r\n\r\nSecond\u{200B} para.\r\n```";
        assert_eq!(normalise_completion(input), "First para.\n\nSecond para.");
    }

    #[test]
    fn soft_hyphen_survives() {
        assert_eq!(normalise_completion("szó\u{00AD}tag"), "szó\u{00AD}tag");
    }
}
