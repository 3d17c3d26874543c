//! OCR job orchestration: submit an analysis job and poll it to a terminal
//! state.
//!
//! ## State machine
//!
//! ```text
//! Submitted ──▶ Running ──▶ Succeeded
//!     │            │  └────▶ Failed
//!     └────────────┴───────▶ TimedOut   (budget exhausted)
//! ```
//!
//! Non-terminal responses (`NotStarted`, `Running`) schedule another poll
//! after a backoff delay that starts at `poll_interval` and grows by
//! `backoff_factor` up to `max_poll_interval`. The loop is bounded by the
//! wall-clock budget `max_wait`, by `max_polls`, or by both, whichever are
//! set; it never assumes the remote job finishes within a fixed number of
//! polls.
//!
//! Transient poll failures (timeouts, 429, 5xx) are tolerated up to
//! `max_poll_errors` in a row; they count against the same budget.

use crate::config::OcrConfig;
use crate::error::ScanError;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Remote document-understanding service.
#[async_trait]
pub trait OcrService: Send + Sync {
    fn name(&self) -> &str;

    /// Start an analysis of the document at `source_url`; returns the job id.
    async fn submit(&self, source_url: &str) -> Result<String, ScanError>;

    /// Query the job's current status.
    async fn poll(&self, job_id: &str) -> Result<PollResponse, ScanError>;

    /// Cheap authenticated call that starts no job. Backends without one
    /// report success.
    async fn check(&self) -> Result<(), ScanError> {
        Ok(())
    }
}

/// Status as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    /// Anything the orchestrator does not recognise.
    Other(String),
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "notstarted" | "not_started" | "queued" => RemoteStatus::NotStarted,
            "running" | "inprogress" | "in_progress" => RemoteStatus::Running,
            "succeeded" | "completed" => RemoteStatus::Succeeded,
            "failed" => RemoteStatus::Failed,
            _ => RemoteStatus::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RemoteStatus::NotStarted => "notstarted",
            RemoteStatus::Running => "running",
            RemoteStatus::Succeeded => "succeeded",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Other(s) => s,
        }
    }
}

/// One poll's answer.
#[derive(Debug, Clone)]
pub struct PollResponse {
    pub status: RemoteStatus,
    /// Present once the job succeeded.
    pub payload: Option<OcrPayload>,
    /// Remote error detail for a failed job.
    pub error: Option<String>,
}

impl PollResponse {
    pub fn running() -> Self {
        Self {
            status: RemoteStatus::Running,
            payload: None,
            error: None,
        }
    }

    pub fn succeeded(payload: OcrPayload) -> Self {
        Self {
            status: RemoteStatus::Succeeded,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Failed,
            payload: None,
            error: Some(detail.into()),
        }
    }
}

/// Page-level structured text returned by a successful job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrPayload {
    /// Markdown-like text per page (or content entry), in page order.
    pub pages: Vec<String>,
    /// The service's raw result document, kept for debug dumps.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl OcrPayload {
    pub fn from_pages<I, S>(pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pages: pages.into_iter().map(Into::into).collect(),
            raw: serde_json::Value::Null,
        }
    }
}

/// Local view of the job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut)
    }
}

/// A job driven by [`OcrOrchestrator::run`].
#[derive(Debug, Clone)]
pub struct OcrJob {
    pub job_id: String,
    pub status: JobStatus,
    pub payload: Option<OcrPayload>,
    pub polls: u32,
    pub sleeps: u32,
    pub elapsed: Duration,
}

impl OcrJob {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Submitted,
            payload: None,
            polls: 0,
            sleeps: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn advance(&mut self, to: JobStatus) {
        if self.status != to {
            debug!("OCR job {}: {:?} -> {:?}", self.job_id, self.status, to);
            self.status = to;
        }
    }
}

/// Drives one OCR job from submission to a terminal state.
pub struct OcrOrchestrator {
    service: Arc<dyn OcrService>,
    config: OcrConfig,
    progress: Option<ProgressCallback>,
}

impl OcrOrchestrator {
    pub fn new(service: Arc<dyn OcrService>, config: OcrConfig) -> Self {
        Self {
            service,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Submit `source_url` and poll until the job succeeds.
    ///
    /// Returns the job in state `Succeeded` with its payload.
    ///
    /// # Errors
    /// * [`ScanError::OcrRequest`] — submit failed, or polling failed more
    ///   than `max_poll_errors` times in a row, or failed permanently.
    /// * [`ScanError::OcrJobFailed`] — the service reported the job failed.
    /// * [`ScanError::OcrTimedOut`] — the time or poll budget ran out.
    /// * [`ScanError::OcrUnexpectedStatus`] — an unknown status came back.
    pub async fn run(&self, source_url: &str) -> Result<OcrJob, ScanError> {
        let start = Instant::now();
        let job_id = self.service.submit(source_url).await?;
        info!("OCR job {} submitted to {}", job_id, self.service.name());

        let mut job = OcrJob::new(job_id);
        let mut delay = self.config.poll_interval;
        let mut consecutive_errors = 0u32;

        loop {
            if let Some(max) = self.config.max_polls {
                if job.polls >= max {
                    return Err(self.timed_out(&mut job, start));
                }
            }

            job.polls += 1;
            match self.service.poll(&job.job_id).await {
                Ok(resp) => {
                    consecutive_errors = 0;
                    if let Some(cb) = &self.progress {
                        cb.on_ocr_poll(job.polls, resp.status.as_str());
                    }
                    match resp.status {
                        RemoteStatus::Succeeded => {
                            job.advance(JobStatus::Succeeded);
                            job.payload = Some(resp.payload.unwrap_or_default());
                            job.elapsed = start.elapsed();
                            info!(
                                "OCR job {} succeeded after {} polls ({:.1}s)",
                                job.job_id,
                                job.polls,
                                job.elapsed.as_secs_f64()
                            );
                            return Ok(job);
                        }
                        RemoteStatus::Failed => {
                            job.advance(JobStatus::Failed);
                            return Err(ScanError::OcrJobFailed {
                                job_id: job.job_id,
                                detail: resp.error.unwrap_or_else(|| "unknown error".into()),
                            });
                        }
                        RemoteStatus::Running => job.advance(JobStatus::Running),
                        RemoteStatus::NotStarted => {}
                        RemoteStatus::Other(status) => {
                            job.advance(JobStatus::Failed);
                            return Err(ScanError::OcrUnexpectedStatus {
                                job_id: job.job_id,
                                status,
                            });
                        }
                    }
                }
                Err(e) if e.is_retryable() && consecutive_errors < self.config.max_poll_errors => {
                    consecutive_errors += 1;
                    warn!(
                        "OCR job {}: poll {} failed ({}/{} tolerated): {}",
                        job.job_id, job.polls, consecutive_errors, self.config.max_poll_errors, e
                    );
                }
                Err(e) => {
                    job.advance(JobStatus::Failed);
                    return Err(e);
                }
            }

            let wait = match self.config.max_wait {
                Some(max_wait) => {
                    let elapsed = start.elapsed();
                    if elapsed >= max_wait {
                        return Err(self.timed_out(&mut job, start));
                    }
                    delay.min(max_wait - elapsed)
                }
                None => delay,
            };
            debug!(
                "OCR job {}: {:?}, next poll in {:?}",
                job.job_id, job.status, wait
            );
            tokio::time::sleep(wait).await;
            job.sleeps += 1;
            delay = self.next_delay(delay);
        }
    }

    /// Grow `delay` by the backoff factor, capped at `max_poll_interval`.
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.config.backoff_factor)
            .unwrap_or(self.config.max_poll_interval)
            .min(self.config.max_poll_interval)
    }

    fn timed_out(&self, job: &mut OcrJob, start: Instant) -> ScanError {
        job.advance(JobStatus::TimedOut);
        job.elapsed = start.elapsed();
        warn!(
            "OCR job {} timed out after {} polls ({:.1}s)",
            job.job_id,
            job.polls,
            job.elapsed.as_secs_f64()
        );
        ScanError::OcrTimedOut {
            job_id: job.job_id.clone(),
            elapsed_secs: job.elapsed.as_secs(),
            polls: job.polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a scripted sequence of poll results; the last one repeats.
    struct Scripted {
        polls: Mutex<VecDeque<Result<PollResponse, ScanError>>>,
        last: Mutex<Option<Result<PollResponse, ScanError>>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<PollResponse, ScanError>>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(script.into()),
                last: Mutex::new(None),
            })
        }
    }

    fn clone_result(r: &Result<PollResponse, ScanError>) -> Result<PollResponse, ScanError> {
        match r {
            Ok(p) => Ok(p.clone()),
            Err(_) => Err(ScanError::ocr_status(503, "busy")),
        }
    }

    #[async_trait]
    impl OcrService for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn submit(&self, _source_url: &str) -> Result<String, ScanError> {
            Ok("job-1".into())
        }

        async fn poll(&self, _job_id: &str) -> Result<PollResponse, ScanError> {
            let next = self.polls.lock().unwrap().pop_front();
            match next {
                Some(r) => {
                    *self.last.lock().unwrap() = Some(clone_result(&r));
                    r
                }
                None => clone_result(self.last.lock().unwrap().as_ref().unwrap()),
            }
        }
    }

    fn orchestrator(service: Arc<Scripted>, config: OcrConfig) -> OcrOrchestrator {
        OcrOrchestrator::new(service, config)
    }

    #[tokio::test(start_paused = true)]
    async fn two_running_polls_then_success_sleeps_twice() {
        let svc = Scripted::new(vec![
            Ok(PollResponse::running()),
            Ok(PollResponse::running()),
            Ok(PollResponse::succeeded(OcrPayload::from_pages(["page one"]))),
        ]);
        let start = Instant::now();
        let job = orchestrator(svc, OcrConfig::default()).run("https://x/doc.pdf").await.unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.polls, 3);
        assert_eq!(job.sleeps, 2);
        assert_eq!(job.payload.unwrap().pages, vec!["page one"]);
        // 2s, then 2s * 1.5
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_carries_detail() {
        let svc = Scripted::new(vec![
            Ok(PollResponse::running()),
            Ok(PollResponse::failed("InvalidContent: not a PDF")),
        ]);
        let err = orchestrator(svc, OcrConfig::default()).run("u").await.unwrap_err();
        match err {
            ScanError::OcrJobFailed { detail, .. } => assert!(detail.contains("not a PDF")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_budget_times_out() {
        let svc = Scripted::new(vec![Ok(PollResponse::running())]);
        let config = OcrConfig {
            max_wait: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let err = orchestrator(svc, config).run("u").await.unwrap_err();
        // Sleeps 2 + 3 + 4.5 + 0.5 (clipped to the budget), then one last poll.
        assert!(matches!(err, ScanError::OcrTimedOut { polls: 5, elapsed_secs: 10, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_cap_times_out() {
        let svc = Scripted::new(vec![Ok(PollResponse::running())]);
        let config = OcrConfig {
            max_polls: Some(3),
            ..Default::default()
        };
        let err = orchestrator(svc, config).run("u").await.unwrap_err();
        assert!(matches!(err, ScanError::OcrTimedOut { polls: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_cap_alone_bounds_the_job() {
        let svc = Scripted::new(vec![
            Ok(PollResponse::running()),
            Ok(PollResponse::running()),
            Ok(PollResponse::succeeded(OcrPayload::from_pages(["late page"]))),
        ]);
        let config = OcrConfig {
            max_wait: None,
            max_polls: Some(10),
            ..Default::default()
        };
        let job = orchestrator(svc, config).run("u").await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.polls, 3);
        assert_eq!(job.sleeps, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_cap_without_wall_clock_still_times_out() {
        let svc = Scripted::new(vec![Ok(PollResponse::running())]);
        let config = OcrConfig {
            max_wait: None,
            max_polls: Some(4),
            ..Default::default()
        };
        let err = orchestrator(svc, config).run("u").await.unwrap_err();
        assert!(matches!(err, ScanError::OcrTimedOut { polls: 4, .. }));
    }

    #[test]
    fn overflowing_backoff_falls_back_to_the_cap() {
        let svc = Scripted::new(vec![]);
        let config = OcrConfig {
            backoff_factor: f64::MAX,
            ..Default::default()
        };
        let orch = orchestrator(svc, config);
        assert_eq!(orch.next_delay(Duration::from_secs(2)), Duration::from_secs(15));

        let orch = orchestrator(Scripted::new(vec![]), OcrConfig::default());
        assert_eq!(orch.next_delay(Duration::from_secs(2)), Duration::from_secs(3));
        assert_eq!(orch.next_delay(Duration::from_secs(12)), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_errors_are_tolerated() {
        let svc = Scripted::new(vec![
            Err(ScanError::ocr_status(503, "busy")),
            Err(ScanError::ocr_status(429, "slow down")),
            Ok(PollResponse::succeeded(OcrPayload::default())),
        ]);
        let job = orchestrator(svc, OcrConfig::default()).run("u").await.unwrap();
        assert_eq!(job.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_poll_errors_propagate() {
        let svc = Scripted::new(vec![Err(ScanError::ocr_status(503, "busy"))]);
        let config = OcrConfig {
            max_poll_errors: 2,
            ..Default::default()
        };
        let err = orchestrator(svc, config).run("u").await.unwrap_err();
        assert!(matches!(err, ScanError::OcrRequest { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_is_an_error() {
        let svc = Scripted::new(vec![Ok(PollResponse {
            status: RemoteStatus::parse("Cancelled"),
            payload: None,
            error: None,
        })]);
        let err = orchestrator(svc, OcrConfig::default()).run("u").await.unwrap_err();
        assert!(matches!(err, ScanError::OcrUnexpectedStatus { .. }));
    }

    #[test]
    fn remote_status_parsing() {
        assert_eq!(RemoteStatus::parse("NotStarted"), RemoteStatus::NotStarted);
        assert_eq!(RemoteStatus::parse("Running"), RemoteStatus::Running);
        assert_eq!(RemoteStatus::parse("Succeeded"), RemoteStatus::Succeeded);
        assert_eq!(RemoteStatus::parse("Failed"), RemoteStatus::Failed);
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
