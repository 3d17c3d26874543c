//! Reconstructor: turn cleaned flat text back into chapter XHTML.
//!
//! Paragraphs are the blank-line separated units of the text. Each one is
//! classified by a [`HeadingPolicy`]:
//!
//! * explicit markdown headings (`# Title`, `## Section`) keep their level;
//! * otherwise a paragraph shorter than `max_chars` that does not end in
//!   sentence-final punctuation becomes an `<h2>`;
//! * everything else is a `<p>`.
//!
//! The length/punctuation rule is a known-imprecise heuristic: a short
//! sentence without a full stop is promoted, and a long title is not.

use serde::Serialize;

/// XHTML body used when a chapter has no text at all.
pub const EMPTY_CHAPTER_BODY: &str = "<p>This chapter appears to be empty.</p>";

/// What a paragraph renders as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    /// Heading with level 1..=6.
    Heading(u8),
    Paragraph,
}

/// Heading-vs-paragraph decision rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadingPolicy {
    /// Paragraphs must be strictly shorter than this (in chars) to be
    /// promoted by the heuristic.
    pub max_chars: usize,
    /// Level assigned by the heuristic.
    pub level: u8,
}

impl Default for HeadingPolicy {
    fn default() -> Self {
        Self {
            max_chars: 100,
            level: 2,
        }
    }
}

impl HeadingPolicy {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            ..Default::default()
        }
    }

    /// Classify one paragraph.
    pub fn classify(&self, paragraph: &str) -> BlockKind {
        let p = paragraph.trim();
        if p.is_empty() {
            return BlockKind::Paragraph;
        }
        if let Some((level, _)) = markdown_heading(p) {
            return BlockKind::Heading(level);
        }
        if p.chars().count() < self.max_chars && !ends_sentence(p) {
            BlockKind::Heading(self.level.clamp(1, 6))
        } else {
            BlockKind::Paragraph
        }
    }
}

/// `# Title` → `(1, "Title")`. Requires a space after the hashes.
fn markdown_heading(p: &str) -> Option<(u8, &str)> {
    let hashes = p.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &p[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim_end();
    if text.is_empty() || text.contains('\n') {
        return None;
    }
    Some((hashes as u8, text))
}

fn ends_sentence(p: &str) -> bool {
    let trimmed = p.trim_end_matches(['"', '\'', ')', ']', '”', '’', '»']);
    matches!(trimmed.chars().last(), Some('.' | '!' | '?' | '…'))
}

/// Split text into trimmed, non-empty paragraphs (blank-line delimited).
pub fn paragraphs(text: &str) -> Vec<&str> {
    super::chunk::split_paragraphs(text)
}

/// First heading in `text` under `policy`, for use as a chapter title.
pub fn first_heading(text: &str, policy: &HeadingPolicy) -> Option<String> {
    paragraphs(text).into_iter().find_map(|p| match policy.classify(p) {
        BlockKind::Heading(_) => Some(join_lines(heading_text(p))),
        BlockKind::Paragraph => None,
    })
}

fn heading_text(p: &str) -> &str {
    markdown_heading(p).map(|(_, t)| t).unwrap_or(p)
}

/// Render cleaned text as the body of an XHTML chapter (no envelope).
///
/// Line breaks inside a paragraph are OCR wrapping and become spaces.
/// Empty text yields [`EMPTY_CHAPTER_BODY`].
pub fn reconstruct_body(text: &str, policy: &HeadingPolicy) -> String {
    let mut body = String::new();
    for p in paragraphs(text) {
        match policy.classify(p) {
            BlockKind::Heading(level) => {
                body.push_str(&format!(
                    "<h{level}>{}</h{level}>\n",
                    escape_xml(&join_lines(heading_text(p)))
                ));
            }
            BlockKind::Paragraph => {
                body.push_str(&format!("<p>{}</p>\n", escape_xml(&join_lines(p))));
            }
        }
    }
    if body.is_empty() {
        body.push_str(EMPTY_CHAPTER_BODY);
        body.push('\n');
    }
    body
}

/// Wrap a body fragment in an XHTML 1.1 / EPUB 3 envelope.
pub fn xhtml_document(title: &str, language: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <!DOCTYPE html>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" \
         lang=\"{lang}\" xml:lang=\"{lang}\">\n\
         <head>\n<meta charset=\"utf-8\"/>\n<title>{title}</title>\n</head>\n\
         <body>\n{body}</body>\n</html>\n",
        lang = escape_xml(language),
        title = escape_xml(title),
        body = body,
    )
}

fn join_lines(p: &str) -> String {
    p.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" ")
}

/// Escape text for XML element content and attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
