//! Chunker: split extracted text into bounded segments for the completion
//! service.
//!
//! Boundaries are tried in priority order:
//!
//! 1. **Paragraphs** (blank-line delimited). A paragraph that fits is one chunk;
//!    paragraphs are never merged.
//! 2. **Sentences**. An oversized paragraph is split after `.`, `!`, `?` or `…`
//!    (optionally followed by closing quotes or brackets) plus whitespace, and
//!    consecutive sentences are packed greedily up to the limit.
//! 3. **Characters**. A single sentence longer than the limit is cut into
//!    limit-sized pieces. Every piece is flagged `forced`.
//!
//! Every chunk remembers how it attaches to its predecessor ([`Joiner`]), so
//! [`rejoin`] restores the original text with whitespace normalised only at
//! split points. Lengths are counted in `char`s, not bytes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r]*\n\s*").unwrap());

/// How a chunk attaches to the chunk before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Joiner {
    /// Starts a new paragraph (also used for the first chunk).
    Paragraph,
    /// Continues the previous chunk's paragraph after a sentence break.
    Sentence,
    /// Continues a sentence that was cut at the character limit.
    Forced,
}

impl Joiner {
    pub fn separator(self) -> &'static str {
        match self {
            Joiner::Paragraph => "\n\n",
            Joiner::Sentence => " ",
            Joiner::Forced => "",
        }
    }
}

/// A bounded text segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// 0-based position in the chunk sequence.
    pub sequence_index: usize,
    pub text: String,
    /// Length of `text` in characters.
    pub char_len: usize,
    pub joiner: Joiner,
    /// Produced by a raw character split instead of a language boundary.
    pub forced: bool,
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Deterministic: the same `(text, max_chars)` always yields the same
/// sequence. A `max_chars` of zero is treated as one.
pub fn chunk(text: &str, max_chars: usize) -> Vec<Chunk> {
    let max = max_chars.max(1);
    let mut out = ChunkSink::default();

    for para in split_paragraphs(text) {
        if char_len(para) <= max {
            out.push(para.to_string(), Joiner::Paragraph, false);
            continue;
        }

        let mut first_in_para = true;
        let mut current = String::new();
        let mut current_len = 0usize;

        for sentence in split_sentences(para) {
            let len = char_len(sentence);
            if len > max {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current), joiner_for(first_in_para), false);
                    first_in_para = false;
                }
                for (i, piece) in force_split(sentence, max).into_iter().enumerate() {
                    let joiner = if i > 0 {
                        Joiner::Forced
                    } else {
                        joiner_for(first_in_para)
                    };
                    out.push(piece, joiner, true);
                }
                first_in_para = false;
            } else if current.is_empty() {
                current.push_str(sentence);
                current_len = len;
            } else if current_len + 1 + len <= max {
                current.push(' ');
                current.push_str(sentence);
                current_len += 1 + len;
            } else {
                out.push(std::mem::take(&mut current), joiner_for(first_in_para), false);
                first_in_para = false;
                current.push_str(sentence);
                current_len = len;
            }
        }
        if !current.is_empty() {
            out.push(current, joiner_for(first_in_para), false);
        }
    }

    out.chunks
}

/// Concatenate chunk texts in order using each chunk's joiner.
pub fn rejoin<S: AsRef<str>>(chunks: &[Chunk], texts: &[S]) -> String {
    let mut s = String::new();
    for (i, (c, t)) in chunks.iter().zip(texts).enumerate() {
        if i > 0 {
            s.push_str(c.joiner.separator());
        }
        s.push_str(t.as_ref());
    }
    s
}

/// Rejoin the chunks' own texts.
pub fn rejoin_chunks(chunks: &[Chunk]) -> String {
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    rejoin(chunks, &texts)
}

#[derive(Default)]
struct ChunkSink {
    chunks: Vec<Chunk>,
}

impl ChunkSink {
    fn push(&mut self, text: String, joiner: Joiner, forced: bool) {
        let char_len = char_len(&text);
        self.chunks.push(Chunk {
            sequence_index: self.chunks.len(),
            text,
            char_len,
            joiner,
            forced,
        });
    }
}

fn joiner_for(first_in_para: bool) -> Joiner {
    if first_in_para {
        Joiner::Paragraph
    } else {
        Joiner::Sentence
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Blank-line separated paragraphs, trimmed, empties dropped.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split a paragraph after sentence-final punctuation followed by whitespace.
///
/// Returned sentences are trimmed; the whitespace between them is dropped.
pub fn split_sentences(para: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = para.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '…') {
            continue;
        }
        // Absorb trailing punctuation and closers: `?!`, `."`, `.)`, `...`
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '…' | '"' | '\'' | ')' | ']' | '”' | '’' | '»') {
                chars.next();
            } else {
                break;
            }
        }
        match chars.peek() {
            Some(&(ws_at, next)) if next.is_whitespace() => {
                let sentence = para[start..ws_at].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                while let Some(&(_, w)) = chars.peek() {
                    if w.is_whitespace() {
                        chars.next();
                    } else {
                        break;
                    }
                }
                start = chars.peek().map(|&(i, _)| i).unwrap_or(para.len());
            }
            _ => {}
        }
    }

    let tail = para[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Cut `s` into pieces of exactly `max` chars (the last may be shorter).
fn force_split(s: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}
