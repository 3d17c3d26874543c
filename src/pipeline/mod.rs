//! Pipeline stages for scan-to-EPUB conversion.
//!
//! Each submodule implements one step. Network-facing steps sit behind a
//! trait ([`storage::BlobStore`], [`ocr::OcrService`], [`llm::CompletionClient`])
//! with the Azure / `edgequake-llm` implementations in their own modules.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ storage ──▶ ocr ──▶ extract ──▶ chunk ──▶ llm ──▶ reconstruct ──▶ epub
//! (path/URL) (upload)   (poll)   (text)     (split)   (clean)  (XHTML)        (package)
//! ```
//!
//! 1. [`input`]       — classify the input as a remote locator or local file
//! 2. [`storage`]     — upload local files under a session, issue read-only
//!    access, delete everything at teardown
//! 3. [`ocr`]         — submit the analysis job and poll it to a terminal state
//! 4. [`extract`]     — OCR payload or EPUB spine → content items
//! 5. [`chunk`]       — split item text at paragraph, sentence, then character
//!    boundaries
//! 6. [`llm`]         — clean each chunk with retry and fallback-to-original
//! 7. [`reconstruct`] — cleaned text → headings and paragraphs
//! 8. [`epub`]        — write (and read) the EPUB package
//!
//! [`artifacts`] holds the OCR-noise diagnostics and completion-output
//! normalisation shared by the cleanup steps.

pub mod artifacts;
pub mod azure_blob;
pub mod azure_cu;
pub mod chunk;
pub mod epub;
pub mod extract;
pub mod input;
pub mod llm;
pub mod ocr;
pub mod reconstruct;
pub mod storage;
