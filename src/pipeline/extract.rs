//! Content Extractor: turn an OCR payload or a read EPUB into [`ContentItem`]s.
//!
//! An item is one logical chapter. Its `id` and `file_name` travel unchanged
//! through chunking and cleanup so the assembler can put the cleaned text
//! back where it came from.

use super::epub::EpubDocument;
use super::ocr::OcrPayload;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, info};

/// Title given to the single chapter built from an OCR result.
pub const OCR_CHAPTER_TITLE: &str = "Document Content";

/// One chapter of source text.
#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    /// File name inside the EPUB package.
    pub file_name: String,
    /// Plain text, paragraphs separated by blank lines.
    pub raw_text: String,
    /// Original XHTML, when the item came from an EPUB.
    pub markup: Option<String>,
}

/// Page texts joined in page order with a blank line. Empty pages are dropped.
pub fn ocr_text(payload: &OcrPayload) -> String {
    payload
        .pages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The OCR result as a single content item.
pub fn items_from_ocr(payload: &OcrPayload) -> Vec<ContentItem> {
    let text = ocr_text(payload);
    info!(
        "Extracted {} characters from {} OCR pages",
        text.chars().count(),
        payload.pages.len()
    );
    vec![ContentItem {
        id: "chapter_001".to_string(),
        title: OCR_CHAPTER_TITLE.to_string(),
        file_name: "chapter_001.xhtml".to_string(),
        raw_text: text,
        markup: None,
    }]
}

/// Extract every spine document of `doc` that carries text.
///
/// Navigation documents are never in `doc.chapters`; items whose text is
/// blank are dropped here.
pub fn items_from_epub(doc: &EpubDocument) -> Vec<ContentItem> {
    let mut items = Vec::with_capacity(doc.chapters.len());
    for chapter in &doc.chapters {
        let text = xhtml_to_text(&chapter.xhtml);
        if text.trim().is_empty() {
            debug!("Skipping empty item '{}'", chapter.id);
            continue;
        }
        items.push(ContentItem {
            id: chapter.id.clone(),
            title: chapter.title.clone(),
            file_name: chapter.file_name.clone(),
            raw_text: text,
            markup: Some(chapter.xhtml.clone()),
        });
    }
    info!(
        "Extracted {} of {} items with text",
        items.len(),
        doc.chapters.len()
    );
    items
}

static RE_DROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<head\b.*?</head>|<script\b.*?</script>|<style\b.*?</style>|<nav\b.*?</nav>|<!--.*?-->")
        .unwrap()
});
static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(p|div|h[1-6]|li|ul|ol|blockquote|section|article|tr|table|pre|body)\b[^>]*>").unwrap()
});
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").unwrap());
static RE_BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Plain text of an XHTML document.
///
/// Block elements become paragraph breaks, `<br>` a line break, and
/// character references are decoded. Inline whitespace is collapsed.
pub fn xhtml_to_text(xhtml: &str) -> String {
    let s = RE_DROP.replace_all(xhtml, "");
    let s = RE_BR.replace_all(&s, "\n");
    let s = RE_BLOCK.replace_all(&s, "\n\n");
    let s = RE_TAG.replace_all(&s, "");
    let s = RE_ENTITY.replace_all(&s, |c: &Captures| decode_entity(&c[1]).unwrap_or_else(|| c[0].to_string()));

    let lines: Vec<String> = s
        .split('\n')
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    RE_BLANKS.replace_all(&lines.join("\n"), "\n\n").trim().to_string()
}

fn decode_entity(name: &str) -> Option<String> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{00A0}',
        "shy" => '\u{00AD}',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "laquo" => '«',
        "raquo" => '»',
        "bdquo" => '„',
        "ldquo" => '“',
        "rdquo" => '”',
        "lsquo" => '‘',
        "rsquo" => '’',
        _ => return None,
    };
    Some(c.to_string())
}
