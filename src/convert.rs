//! Pipeline entry points.
//!
//! | Function              | Input                | Output            |
//! |-----------------------|----------------------|-------------------|
//! | [`run_ocr`]           | scan (path or URL)   | raw OCR EPUB      |
//! | [`run_cleanup`]       | EPUB                 | cleaned EPUB      |
//! | [`run_full_pipeline`] | scan (path or URL)   | cleaned EPUB      |
//!
//! External services are passed in, never discovered: [`OcrBackends`] for the
//! OCR phase and a [`CompletionClient`] for cleanup. Configuration comes from
//! the [`PipelineConfig`] argument only.
//!
//! ## Session teardown
//!
//! A local input is uploaded under a [`Session`]. Everything after the upload
//! runs inside [`BlobLifecycleManager::with_session`], so the upload is
//! deleted on every exit path. The OCR phase also releases it as soon as the
//! service has read it; teardown at the end is then a no-op.

use crate::config::PipelineConfig;
use crate::debug::{DebugArtifacts, InterimItem};
use crate::error::ScanError;
use crate::output::{CleanupStats, ItemReport, OcrOutcome, PipelineOutcome};
use crate::pipeline::artifacts::analyze;
use crate::pipeline::chunk::{chunk, rejoin};
use crate::pipeline::epub::{read_epub, validate_output_path, write_epub, EpubChapter, EpubDocument, EpubMetadata};
use crate::pipeline::extract::{items_from_epub, items_from_ocr, ocr_text, ContentItem};
use crate::pipeline::input::{resolve_input, resolve_local, InputSource};
use crate::pipeline::llm::{clean_all, CompletionClient};
use crate::pipeline::ocr::{OcrJob, OcrOrchestrator, OcrService};
use crate::pipeline::reconstruct::{first_heading, reconstruct_body, HeadingPolicy};
use crate::pipeline::storage::{BlobLifecycleManager, BlobStore};
use crate::progress::{ProgressCallback, Stage};
use crate::session::Session;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Suffix appended to the title of a cleaned book.
pub const CLEANED_TITLE_SUFFIX: &str = " (Cleaned)";

/// Services used by the OCR phase.
#[derive(Clone)]
pub struct OcrBackends {
    pub ocr: Arc<dyn OcrService>,
    /// Temporary storage for local inputs. Not needed for URL inputs.
    pub storage: Option<Arc<dyn BlobStore>>,
}

/// OCR a scan into a raw EPUB (one chapter holding the OCR text).
///
/// # Errors
/// Fatal errors only (see [`ScanError`]). Teardown of any temporary upload
/// has already run when this returns.
pub async fn run_ocr(
    input: &str,
    output: &Path,
    backends: &OcrBackends,
    config: &PipelineConfig,
) -> Result<OcrOutcome, ScanError> {
    let start = Instant::now();
    config.validate()?;
    validate_output_path(output)?;
    let source = resolve_input(input)?;
    info!("Starting OCR: {}", input);

    let artifacts = DebugArtifacts::for_run(&config.processing, output);
    let session = Session::new();
    let manager = lifecycle_manager(&source, backends, config)?;

    let work = async {
        let (job, mut outcome) =
            ocr_phase(&source, manager.as_ref(), &session, backends, config, artifacts.as_ref()).await?;
        let doc = ocr_document(&source, &job, config);

        stage(config, Stage::Assemble);
        write_epub_blocking(doc, output.to_path_buf()).await?;
        outcome.output_path = Some(output.to_path_buf());
        Ok::<_, ScanError>(outcome)
    };
    let mut outcome = with_teardown(manager.as_ref(), &session, work).await?;
    outcome.released = session.released_count() as usize;

    if let Some(cb) = &config.progress_callback {
        cb.on_complete(0, 0);
    }
    info!(
        "OCR complete: {} pages, {} chars, {}ms total",
        outcome.pages,
        outcome.text_chars,
        start.elapsed().as_millis()
    );
    Ok(outcome)
}

/// Clean an existing EPUB.
///
/// Every spine document with text is chunked, cleaned and reconstructed.
/// The output keeps the source metadata with " (Cleaned)" added to the title.
pub async fn run_cleanup(
    input: &Path,
    output: &Path,
    client: &dyn CompletionClient,
    config: &PipelineConfig,
) -> Result<CleanupStats, ScanError> {
    let start = Instant::now();
    config.validate()?;
    validate_output_path(output)?;
    let input = resolve_local(input)?;
    info!("Starting cleanup: {}", input.display());

    let artifacts = DebugArtifacts::for_run(&config.processing, output);

    stage(config, Stage::Extract);
    let doc = read_epub_blocking(input).await?;
    let items = items_from_epub(&doc);
    let skipped = doc.chapters.len() - items.len();
    if items.is_empty() {
        return Err(ScanError::NoContent);
    }

    let (chapters, mut stats) =
        clean_items(&items, &doc.metadata.language, client, config, artifacts.as_ref()).await;
    stats.skipped_items = skipped;

    let cleaned = EpubDocument {
        metadata: cleaned_metadata(&doc.metadata),
        chapters,
    };
    stage(config, Stage::Assemble);
    write_epub_blocking(cleaned, output.to_path_buf()).await?;

    stats.total_duration_ms = start.elapsed().as_millis() as u64;
    finish_cleanup(config, &stats);
    Ok(stats)
}

/// OCR a scan and clean the result in one run.
///
/// The OCR document is handed to the cleanup phase in memory. An interim
/// OCR-only EPUB is written to the artifact directory when debug or
/// save-interim is on.
pub async fn run_full_pipeline(
    input: &str,
    output: &Path,
    backends: &OcrBackends,
    client: &dyn CompletionClient,
    config: &PipelineConfig,
) -> Result<PipelineOutcome, ScanError> {
    let start = Instant::now();
    config.validate()?;
    validate_output_path(output)?;
    let source = resolve_input(input)?;
    info!("Starting full pipeline: {}", input);

    let artifacts = DebugArtifacts::for_run(&config.processing, output);
    let session = Session::new();
    let manager = lifecycle_manager(&source, backends, config)?;

    let work = async {
        let (job, mut ocr) =
            ocr_phase(&source, manager.as_ref(), &session, backends, config, artifacts.as_ref()).await?;
        let ocr_doc = ocr_document(&source, &job, config);

        let interim_path = match &artifacts {
            Some(a) => {
                let path = a.interim_epub_path(&source.stem());
                match write_epub_blocking(ocr_doc.clone(), path.clone()).await {
                    Ok(()) => Some(path),
                    Err(e) => {
                        warn!("Could not write interim EPUB: {}", e);
                        None
                    }
                }
            }
            None => None,
        };
        ocr.output_path = interim_path.clone();

        stage(config, Stage::Extract);
        let items: Vec<ContentItem> = match job.payload.as_ref() {
            Some(p) => items_from_ocr(p),
            None => Vec::new(),
        };
        if items.iter().all(|i| i.raw_text.trim().is_empty()) {
            return Err(ScanError::NoContent);
        }

        let (chapters, mut cleanup) = clean_items(
            &items,
            &ocr_doc.metadata.language,
            client,
            config,
            artifacts.as_ref(),
        )
        .await;
        let cleaned = EpubDocument {
            metadata: cleaned_metadata(&ocr_doc.metadata),
            chapters,
        };

        stage(config, Stage::Assemble);
        write_epub_blocking(cleaned, output.to_path_buf()).await?;
        cleanup.total_duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ScanError>(PipelineOutcome {
            ocr,
            cleanup,
            output_path: output.to_path_buf(),
            interim_path,
            total_duration_ms: 0,
        })
    };

    let mut outcome = with_teardown(manager.as_ref(), &session, work).await?;
    outcome.ocr.released = session.released_count() as usize;
    outcome.total_duration_ms = start.elapsed().as_millis() as u64;
    finish_cleanup(config, &outcome.cleanup);
    Ok(outcome)
}

// ── Phases ───────────────────────────────────────────────────────────────────

/// A manager is needed only for local input; its absence is a setup error.
fn lifecycle_manager(
    source: &InputSource,
    backends: &OcrBackends,
    config: &PipelineConfig,
) -> Result<Option<BlobLifecycleManager>, ScanError> {
    match (source, &backends.storage) {
        (InputSource::Remote(_), _) => Ok(None),
        (InputSource::Local(_), Some(store)) => Ok(Some(BlobLifecycleManager::new(
            Arc::clone(store),
            config.storage.clone(),
        ))),
        (InputSource::Local(_), None) => Err(ScanError::MissingSetting {
            name: "AZURE_STORAGE_CONNECTION_STRING".into(),
            hint: "Local files are uploaded to temporary storage before OCR; \
                   configure storage or pass an http(s) URL instead."
                .into(),
        }),
    }
}

async fn with_teardown<T, F>(
    manager: Option<&BlobLifecycleManager>,
    session: &Session,
    work: F,
) -> Result<T, ScanError>
where
    F: Future<Output = Result<T, ScanError>>,
{
    match manager {
        Some(m) => m.with_session(session, work).await,
        None => work.await,
    }
}

/// Upload (local input), run the OCR job, then release the upload.
async fn ocr_phase(
    source: &InputSource,
    manager: Option<&BlobLifecycleManager>,
    session: &Session,
    backends: &OcrBackends,
    config: &PipelineConfig,
    artifacts: Option<&DebugArtifacts>,
) -> Result<(OcrJob, OcrOutcome), ScanError> {
    let url = match (source, manager) {
        (InputSource::Remote(url), _) => url.clone(),
        (InputSource::Local(path), Some(manager)) => {
            stage(config, Stage::Upload);
            let handle = manager.upload(path, session).await?;
            if let Some(cb) = &config.progress_callback {
                cb.on_upload_complete(&handle.remote_name, handle.size_bytes);
            }
            handle.access.url.clone()
        }
        (InputSource::Local(path), None) => {
            return Err(ScanError::Internal(format!(
                "no storage manager for local input {}",
                path.display()
            )))
        }
    };

    stage(config, Stage::Ocr);
    let job = OcrOrchestrator::new(Arc::clone(&backends.ocr), config.ocr.clone())
        .with_progress(config.progress_callback.clone())
        .run(&url)
        .await?;

    if let Some(manager) = manager {
        stage(config, Stage::Teardown);
        manager.release_all(session).await;
    }

    let (pages, text_chars) = match &job.payload {
        Some(p) => {
            let text = ocr_text(p);
            if let Some(a) = artifacts {
                a.write_ocr_result(&p.raw);
                a.write_extracted_text(&text);
            }
            (p.pages.len(), text.chars().count())
        }
        None => (0, 0),
    };

    let outcome = OcrOutcome {
        job_id: job.job_id.clone(),
        polls: job.polls,
        sleeps: job.sleeps,
        pages,
        text_chars,
        uploaded: session.created_count() as usize,
        released: session.released_count() as usize,
        duration_ms: job.elapsed.as_millis() as u64,
        output_path: None,
    };
    Ok((job, outcome))
}

/// The OCR result as an EPUB: title from the input name, one chapter.
fn ocr_document(source: &InputSource, job: &OcrJob, config: &PipelineConfig) -> EpubDocument {
    let language = config.processing.language.as_str();
    let policy = HeadingPolicy::new(config.cleanup.heading_max_chars);
    let items = match job.payload.as_ref() {
        Some(p) => items_from_ocr(p),
        None => Vec::new(),
    };
    let chapters = items
        .iter()
        .map(|item| {
            EpubChapter::from_body(
                item.id.clone(),
                chapter_title(item, &item.raw_text, &policy),
                item.file_name.clone(),
                &reconstruct_body(&item.raw_text, &policy),
                language,
            )
        })
        .collect();
    EpubDocument {
        metadata: EpubMetadata::new(source.stem(), config.processing.author.clone(), language),
        chapters,
    }
}

/// Chunk, clean and reconstruct every item, in order.
async fn clean_items(
    items: &[ContentItem],
    language: &str,
    client: &dyn CompletionClient,
    config: &PipelineConfig,
    artifacts: Option<&DebugArtifacts>,
) -> (Vec<EpubChapter>, CleanupStats) {
    stage(config, Stage::Cleanup);
    let policy = HeadingPolicy::new(config.cleanup.heading_max_chars);
    let progress: Option<&ProgressCallback> = config.progress_callback.as_ref();
    let llm_start = Instant::now();

    let mut stats = CleanupStats {
        items: items.len(),
        ..Default::default()
    };
    let mut chapters = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let report = analyze(&item.raw_text);
        debug!("Item '{}': {:?}", item.id, report);

        let chunks = chunk(&item.raw_text, config.cleanup.max_chunk_chars);
        let forced = chunks.iter().filter(|c| c.forced).count();
        info!(
            "Item {}/{} '{}': {} chunks ({} force-split), {} artifacts",
            i + 1,
            items.len(),
            item.title,
            chunks.len(),
            forced,
            report.total()
        );
        if let Some(cb) = progress {
            cb.on_item_start(i, items.len(), chunks.len());
        }

        let item_artifacts = artifacts.map(|a| a.for_item(i));
        if let Some(a) = &item_artifacts {
            a.write_original_item(&item.id, &item.raw_text);
        }

        let results = clean_all(&chunks, client, &config.cleanup, progress, item_artifacts.as_ref()).await;
        let fallbacks = results.iter().filter(|r| r.used_fallback).count();
        if fallbacks > 0 {
            warn!(
                "Item '{}': {} of {} chunks kept their original text",
                item.id,
                fallbacks,
                chunks.len()
            );
        }

        let texts: Vec<&str> = results.iter().map(|r| r.cleaned_text.as_str()).collect();
        let cleaned = rejoin(&chunks, &texts);
        let body = reconstruct_body(&cleaned, &policy);

        if let Some(a) = artifacts {
            a.save_interim_item(&InterimItem {
                id: &item.id,
                title: &item.title,
                original_text: &item.raw_text,
                cleaned_text: &cleaned,
                markup: &body,
                chunks: chunks.len(),
                fallbacks,
                artifacts: report,
            });
        }

        stats.total_chunks += chunks.len();
        stats.forced_chunks += forced;
        stats.fallback_chunks += fallbacks;
        stats.total_attempts += results.iter().map(|r| r.attempts as u64).sum::<u64>();
        stats.total_input_tokens += results.iter().map(|r| r.input_tokens as u64).sum::<u64>();
        stats.total_output_tokens += results.iter().map(|r| r.output_tokens as u64).sum::<u64>();
        stats.artifacts += report;
        stats.per_item.push(ItemReport {
            id: item.id.clone(),
            title: item.title.clone(),
            chunks: chunks.len(),
            forced_chunks: forced,
            fallbacks,
            original_chars: item.raw_text.chars().count(),
            cleaned_chars: cleaned.chars().count(),
            artifacts: report,
        });

        chapters.push(EpubChapter::from_body(
            item.id.clone(),
            chapter_title(item, &cleaned, &policy),
            item.file_name.clone(),
            &body,
            language,
        ));
    }

    stats.llm_duration_ms = llm_start.elapsed().as_millis() as u64;
    (chapters, stats)
}

/// OCR items carry only a placeholder title; their first heading names the
/// chapter instead. Items read from an EPUB keep their own title.
fn chapter_title(item: &ContentItem, text: &str, policy: &HeadingPolicy) -> String {
    if item.markup.is_some() {
        return item.title.clone();
    }
    first_heading(text, policy).unwrap_or_else(|| item.title.clone())
}

fn cleaned_metadata(source: &EpubMetadata) -> EpubMetadata {
    EpubMetadata {
        title: format!("{}{}", source.title, CLEANED_TITLE_SUFFIX),
        ..source.clone()
    }
}

fn finish_cleanup(config: &PipelineConfig, stats: &CleanupStats) {
    if stats.degraded() {
        warn!(
            "Cleanup degraded: {} of {} chunks kept their original text",
            stats.fallback_chunks, stats.total_chunks
        );
    }
    info!(
        "Cleanup complete: {} items, {} chunks, {} in / {} out tokens, {}ms",
        stats.items,
        stats.total_chunks,
        stats.total_input_tokens,
        stats.total_output_tokens,
        stats.total_duration_ms
    );
    if let Some(cb) = &config.progress_callback {
        cb.on_complete(stats.total_chunks, stats.fallback_chunks);
    }
}

fn stage(config: &PipelineConfig, stage: Stage) {
    debug!("Stage: {}", stage);
    if let Some(cb) = &config.progress_callback {
        cb.on_stage(stage);
    }
}

async fn write_epub_blocking(doc: EpubDocument, path: PathBuf) -> Result<(), ScanError> {
    tokio::task::spawn_blocking(move || write_epub(&doc, &path))
        .await
        .map_err(|e| ScanError::Internal(format!("EPUB writer task failed: {e}")))?
}

async fn read_epub_blocking(path: PathBuf) -> Result<EpubDocument, ScanError> {
    tokio::task::spawn_blocking(move || read_epub(&path))
        .await
        .map_err(|e| ScanError::Internal(format!("EPUB reader task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaned_title_keeps_other_metadata() {
        let m = EpubMetadata::new("Könyv", "Szerző", "hu");
        let c = cleaned_metadata(&m);
        assert_eq!(c.title, "Könyv (Cleaned)");
        assert_eq!(c.identifier, m.identifier);
        assert_eq!(c.language, "hu");
    }

    fn finished_job(pages: &[&str]) -> OcrJob {
        OcrJob {
            job_id: "job-1".into(),
            status: crate::pipeline::ocr::JobStatus::Succeeded,
            payload: Some(crate::pipeline::ocr::OcrPayload::from_pages(pages.iter().copied())),
            polls: 1,
            sleeps: 0,
            elapsed: std::time::Duration::ZERO,
        }
    }

    #[test]
    fn ocr_chapter_is_named_after_its_first_heading() {
        let source = InputSource::Remote("https://example.com/konyv.pdf".into());
        let config = PipelineConfig::default();

        let doc = ocr_document(&source, &finished_job(&["Első fejezet", "Egy teljes mondat."]), &config);
        assert_eq!(doc.metadata.title, "konyv");
        assert_eq!(doc.chapters[0].title, "Első fejezet");

        let doc = ocr_document(&source, &finished_job(&["Csak egy mondat."]), &config);
        assert_eq!(doc.chapters[0].title, crate::pipeline::extract::OCR_CHAPTER_TITLE);
    }

    #[test]
    fn local_input_without_storage_is_configuration_error() {
        struct NoOcr;
        #[async_trait::async_trait]
        impl OcrService for NoOcr {
            fn name(&self) -> &str {
                "none"
            }
            async fn submit(&self, _url: &str) -> Result<String, ScanError> {
                unreachable!()
            }
            async fn poll(&self, _job: &str) -> Result<crate::pipeline::ocr::PollResponse, ScanError> {
                unreachable!()
            }
        }
        let backends = OcrBackends {
            ocr: Arc::new(NoOcr),
            storage: None,
        };
        let err = match lifecycle_manager(&InputSource::Local("a.pdf".into()), &backends, &PipelineConfig::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        assert!(lifecycle_manager(&InputSource::Remote("https://x/a.pdf".into()), &backends, &PipelineConfig::default())
            .unwrap()
            .is_none());
    }
}
