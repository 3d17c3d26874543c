//! CLI binary for scan2epub.
//!
//! A thin shim over the library crate: resolves secrets from the environment
//! (and `.env`), builds the service backends, maps flags onto
//! `PipelineConfig`, and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_llm::{LLMProvider, ProviderFactory};
use indicatif::{ProgressBar, ProgressStyle};
use scan2epub::pipeline::azure_blob::AzureBlobStore;
use scan2epub::pipeline::azure_cu::AzureContentUnderstanding;
use scan2epub::pipeline::llm::{CompletionClient, LlmCompletionClient};
use scan2epub::pipeline::ocr::OcrService;
use scan2epub::pipeline::storage::BlobStore;
use scan2epub::{
    run_cleanup, run_full_pipeline, run_ocr, OcrBackends, PipelineConfig,
    PipelineProgressCallback, Preflight, PreflightReport, ProgressCallback, ScanError, Stage,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner while uploading and waiting for OCR, then a
/// chunk bar per content item. Fallback chunks are printed in yellow so a
/// degraded run is visible at a glance.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(spinner_style());
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(TICKS)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} chunks  \
         ⏱ {elapsed_precise}  ETA {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS)
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage(&self, stage: Stage) {
        let msg = match stage {
            Stage::Upload => "uploading scan to temporary storage…",
            Stage::Ocr => "waiting for the OCR job…",
            Stage::Extract => "extracting text…",
            Stage::Cleanup => "preparing chunks…",
            Stage::Assemble => "writing EPUB…",
            Stage::Teardown => "removing temporary uploads…",
        };
        if stage != Stage::Cleanup {
            self.bar.set_style(spinner_style());
        }
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message(msg);
    }

    fn on_upload_complete(&self, remote_name: &str, size_bytes: u64) {
        self.bar.println(format!(
            "  {} Uploaded {}  {}",
            green("✓"),
            remote_name,
            dim(&format!("{:.1} MiB", size_bytes as f64 / (1024.0 * 1024.0))),
        ));
    }

    fn on_ocr_poll(&self, poll: u32, status: &str) {
        self.bar.set_message(format!("poll {poll}: {status}"));
    }

    fn on_item_start(&self, item: usize, total_items: usize, chunk_count: usize) {
        self.bar.set_style(bar_style());
        self.bar.set_length(chunk_count as u64);
        self.bar.set_position(0);
        self.bar.reset_eta();
        self.bar.set_prefix(format!("Item {}/{}", item + 1, total_items));
    }

    fn on_chunk_complete(&self, index: usize, total: usize, used_fallback: bool) {
        if used_fallback {
            self.bar.println(format!(
                "  {} Chunk {:>3}/{:<3}  {}",
                yellow("⚠"),
                index + 1,
                total,
                yellow("kept original text"),
            ));
        }
        self.bar.inc(1);
    }

    fn on_complete(&self, chunks: usize, fallbacks: usize) {
        self.bar.finish_and_clear();
        if chunks == 0 {
            return;
        }
        if fallbacks == 0 {
            eprintln!(
                "{} {} chunks cleaned",
                green("✔"),
                bold(&chunks.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} chunks cleaned  ({} kept original text)",
                cyan("⚠"),
                bold(&(chunks - fallbacks).to_string()),
                chunks,
                yellow(&fallbacks.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline: scanned PDF → OCR → cleanup → EPUB
  scan2epub pipeline book.pdf book.epub

  # OCR only, from a URL (no upload needed)
  scan2epub ocr https://example.com/scans/book.pdf book_raw.epub

  # Clean an existing EPUB
  scan2epub clean book_raw.epub book_clean.epub

  # Keep debug artifacts and interim results next to the output
  scan2epub --debug --save-interim pipeline book.pdf out/book.epub

  # English text, specific model
  scan2epub --language en --provider openai --model gpt-4.1-mini pipeline book.pdf book.epub

  # JSON statistics on stdout
  scan2epub --json clean book_raw.epub book_clean.epub > stats.json

  # Verify storage, OCR and completion credentials before a long run
  scan2epub check

ENVIRONMENT VARIABLES:
  AZURE_STORAGE_CONNECTION_STRING  Temporary blob storage for local scans
  AZURE_CU_ENDPOINT                Content Understanding resource endpoint
  AZURE_CU_API_KEY                 Content Understanding key
  AZURE_CU_API_VERSION             Override the analyzer API version
  EDGEQUAKE_LLM_PROVIDER           Cleanup provider (openai, anthropic, gemini, ollama, azure)
  EDGEQUAKE_MODEL                  Cleanup model ID
  OPENAI_API_KEY, ANTHROPIC_API_KEY, GEMINI_API_KEY, …  Provider keys
  RUST_LOG                         Override log filtering

  Variables may also be placed in a `.env` file in the working directory.

CONFIGURATION FILE:
  scan2epub.toml (or --config PATH) with [storage], [ocr], [cleanup] and
  [processing] sections. A missing file means defaults.
"#;

/// Turn scanned books into clean, reflowable EPUBs.
#[derive(Parser, Debug)]
#[command(
    name = "scan2epub",
    version,
    about = "Turn scanned books into clean, reflowable EPUBs",
    long_about = "OCR a scanned PDF with a remote document-analysis service, repair the \
OCR artifacts (hyphenation, stray page numbers, hard line breaks) with a completion model, \
and package the result as an EPUB 3 book.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Configuration file (TOML).
    #[arg(long, global = true, env = "SCAN2EPUB_CONFIG", default_value = "scan2epub.toml")]
    config: PathBuf,

    /// Write debug artifacts (OCR JSON, extracted text, completion requests).
    #[arg(long, global = true, env = "SCAN2EPUB_DEBUG")]
    debug: bool,

    /// Directory for debug artifacts (default: next to the output).
    #[arg(long, global = true, env = "SCAN2EPUB_DEBUG_DIR")]
    debug_dir: Option<PathBuf>,

    /// Save per-item interim results and the raw OCR EPUB.
    #[arg(long, global = true, env = "SCAN2EPUB_SAVE_INTERIM")]
    save_interim: bool,

    /// Language of the book (BCP 47, e.g. hu, en).
    #[arg(long, global = true, env = "SCAN2EPUB_LANGUAGE")]
    language: Option<String>,

    /// Author written into the EPUB metadata.
    #[arg(long, global = true, env = "SCAN2EPUB_AUTHOR")]
    author: Option<String>,

    /// Number of concurrent completion calls.
    #[arg(short, long, global = true, env = "SCAN2EPUB_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Output statistics as JSON on stdout.
    #[arg(long, global = true, env = "SCAN2EPUB_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "SCAN2EPUB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SCAN2EPUB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SCAN2EPUB_QUIET")]
    quiet: bool,

    #[command(flatten)]
    services: ServiceArgs,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Scanned PDF (path or URL) → raw OCR EPUB.
    Ocr {
        input: String,
        output: PathBuf,
    },
    /// EPUB → cleaned EPUB.
    Clean {
        input: PathBuf,
        output: PathBuf,
    },
    /// Scanned PDF → OCR → cleanup → EPUB.
    Pipeline {
        input: String,
        output: PathBuf,
    },
    /// Check configuration and service credentials, then exit.
    Check,
}

/// Service endpoints and credentials. Secrets only come from here.
#[derive(Args, Debug)]
struct ServiceArgs {
    #[arg(long, global = true, env = "AZURE_STORAGE_CONNECTION_STRING", hide_env_values = true)]
    storage_connection_string: Option<String>,

    #[arg(long, global = true, env = "AZURE_CU_ENDPOINT")]
    cu_endpoint: Option<String>,

    #[arg(long, global = true, env = "AZURE_CU_API_KEY", hide_env_values = true)]
    cu_api_key: Option<String>,

    #[arg(long, global = true, env = "AZURE_CU_API_VERSION")]
    cu_api_version: Option<String>,

    /// Cleanup provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Cleanup model ID.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,
}

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

#[tokio::main]
async fn main() {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Suppress INFO-level library logs when the progress bar is active.
    let is_check = matches!(cli.mode, Mode::Check);
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !is_check;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress || is_check {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli, show_progress).await {
        eprintln!("{} {:#}", red("✘"), e);
        if let Some(scan) = e.chain().find_map(|c| c.downcast_ref::<ScanError>()) {
            eprintln!("  {}", dim(scan.kind().hint()));
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, show_progress: bool) -> Result<()> {
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;
    let http = reqwest::Client::new();

    // The check reports an invalid configuration itself.
    if !matches!(cli.mode, Mode::Check) {
        config.validate().context("Invalid configuration")?;
    }

    match &cli.mode {
        Mode::Ocr { input, output } => {
            let backends = build_ocr_backends(&cli.services, &http)?;
            let outcome = run_ocr(input, output, &backends, &config)
                .await
                .context("OCR failed")?;
            if cli.json {
                print_json(&outcome)?;
            } else if !cli.quiet {
                eprintln!(
                    "{}  {} pages  {} chars  {} polls  {}ms  →  {}",
                    green("✔"),
                    outcome.pages,
                    outcome.text_chars,
                    outcome.polls,
                    outcome.duration_ms,
                    bold(&output.display().to_string()),
                );
            }
        }
        Mode::Clean { input, output } => {
            let client = build_completion_client(&cli.services, &config)?;
            let stats = run_cleanup(input, output, &client, &config)
                .await
                .context("Cleanup failed")?;
            if cli.json {
                print_json(&stats)?;
            } else if !cli.quiet {
                print_cleanup_summary(&stats, output);
            }
        }
        Mode::Pipeline { input, output } => {
            let backends = build_ocr_backends(&cli.services, &http)?;
            let client = build_completion_client(&cli.services, &config)?;
            let outcome = run_full_pipeline(input, output, &backends, &client, &config)
                .await
                .context("Pipeline failed")?;
            if cli.json {
                print_json(&outcome)?;
            } else if !cli.quiet {
                print_cleanup_summary(&outcome.cleanup, output);
                if let Some(ref interim) = outcome.interim_path {
                    eprintln!("   interim OCR EPUB: {}", dim(&interim.display().to_string()));
                }
            }
        }
        Mode::Check => {
            let report = run_check(&cli.services, &http, &config).await;
            if cli.json {
                print_json(&report)?;
            } else if !cli.quiet {
                print_preflight(&report);
            }
            let failed = report.failures().count();
            if failed > 0 {
                anyhow::bail!("{} of {} checks failed", failed, report.checks.len());
            }
        }
    }
    Ok(())
}

/// Check every service the full pipeline needs.
async fn run_check(
    services: &ServiceArgs,
    http: &reqwest::Client,
    config: &PipelineConfig,
) -> PreflightReport {
    let storage = build_storage(services, http)
        .map_err(|e| format!("{e:#}"))
        .and_then(|s| {
            s.ok_or_else(|| "AZURE_STORAGE_CONNECTION_STRING is not set (needed for local scans)".to_string())
        });
    let ocr = build_ocr_service(services, http).map_err(|e| format!("{e:#}"));
    let completion = build_completion_client(services, config)
        .map(|c| Arc::new(c) as Arc<dyn CompletionClient>)
        .map_err(|e| format!("{e:#}"));

    Preflight::new(config)
        .storage(storage)
        .ocr(ocr)
        .completion(completion)
        .run()
        .await
}

/// Load the config file and apply CLI overrides on top.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if cli.debug {
        config.processing.debug = true;
    }
    if cli.save_interim {
        config.processing.save_interim = true;
    }
    if let Some(ref dir) = cli.debug_dir {
        config.processing.debug_dir = Some(dir.clone());
    }
    if let Some(ref lang) = cli.language {
        config.processing.language = lang.clone();
    }
    if let Some(ref author) = cli.author {
        config.processing.author = author.clone();
    }
    if let Some(n) = cli.concurrency {
        config.cleanup.concurrency = n;
    }
    config.progress_callback = progress;
    Ok(config)
}

fn build_ocr_backends(services: &ServiceArgs, http: &reqwest::Client) -> Result<OcrBackends> {
    // Storage is only needed for local inputs; the pipeline reports a
    // configuration error if a local file arrives without it.
    Ok(OcrBackends {
        ocr: build_ocr_service(services, http)?,
        storage: build_storage(services, http)?,
    })
}

fn build_ocr_service(services: &ServiceArgs, http: &reqwest::Client) -> Result<Arc<dyn OcrService>> {
    let endpoint = services.cu_endpoint.clone().unwrap_or_default();
    let key = services.cu_api_key.clone().unwrap_or_default();
    let mut cu = AzureContentUnderstanding::new(endpoint, key, http.clone())?;
    if let Some(ref version) = services.cu_api_version {
        cu = cu.with_api_version(version.clone());
    }
    Ok(Arc::new(cu) as Arc<dyn OcrService>)
}

fn build_storage(services: &ServiceArgs, http: &reqwest::Client) -> Result<Option<Arc<dyn BlobStore>>> {
    match services.storage_connection_string.as_deref() {
        Some(s) if !s.trim().is_empty() => {
            let store = AzureBlobStore::from_connection_string(s, http.clone())?;
            Ok(Some(Arc::new(store) as Arc<dyn BlobStore>))
        }
        _ => Ok(None),
    }
}

fn build_completion_client(
    services: &ServiceArgs,
    config: &PipelineConfig,
) -> Result<LlmCompletionClient> {
    let (provider, label) = resolve_provider(services)?;
    Ok(LlmCompletionClient::new(
        provider,
        label,
        config.cleanup.api_timeout_secs,
    ))
}

/// Named provider if given, otherwise auto-detection from API key variables.
fn resolve_provider(services: &ServiceArgs) -> Result<(Arc<dyn LLMProvider>, String)> {
    if let Some(name) = services.provider.as_deref().filter(|p| !p.is_empty()) {
        let model = services.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
            ScanError::MissingSetting {
                name: format!("{} credentials", name),
                hint: format!("Provider '{}' could not be configured: {}", name, e),
            }
        })?;
        return Ok((provider, format!("{name}/{model}")));
    }

    // Prefer OpenAI when its key is present, as a stable default with many keys set.
    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let model = services.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let provider = ProviderFactory::create_llm_provider("openai", model).map_err(|e| {
            ScanError::MissingSetting {
                name: "OPENAI_API_KEY".into(),
                hint: format!("OpenAI provider could not be configured: {e}"),
            }
        })?;
        return Ok((provider, format!("openai/{model}")));
    }

    let (provider, _) = ProviderFactory::from_env().map_err(|e| ScanError::MissingSetting {
        name: "EDGEQUAKE_LLM_PROVIDER".into(),
        hint: format!("No completion provider auto-detected: {e}"),
    })?;
    Ok((provider, "auto".to_string()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialise output")?
    );
    Ok(())
}

fn print_preflight(report: &PreflightReport) {
    for check in &report.checks {
        let mark = if check.passed { green("✓") } else { red("✗") };
        eprintln!(
            "  {} {:<20} {}  {}",
            mark,
            bold(&check.service.to_string()),
            check.detail,
            dim(&format!("{}ms", check.duration_ms)),
        );
    }
    if report.all_passed() {
        eprintln!("{} All services ready", green("✔"));
    }
}

fn print_cleanup_summary(stats: &scan2epub::CleanupStats, output: &std::path::Path) {
    eprintln!(
        "{}  {} items  {} chunks  {} fallbacks  {}ms  →  {}",
        if stats.degraded() { cyan("⚠") } else { green("✔") },
        stats.items,
        stats.total_chunks,
        stats.fallback_chunks,
        stats.total_duration_ms,
        bold(&output.display().to_string()),
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out",
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
    );
}
