//! Service preflight: one cheap call per service, no document processed.
//!
//! Each check is independent; a failing one does not stop the others, so a
//! single run shows every broken setting at once.
//!
//! | Service       | Call                                                   |
//! |---------------|--------------------------------------------------------|
//! | configuration | [`PipelineConfig::validate`]                           |
//! | storage       | `ensure_container`, then sign a read-only descriptor   |
//! | ocr           | [`OcrService::check`]                                  |
//! | completion    | one request with `max_tokens = 1`                      |

use crate::config::PipelineConfig;
use crate::pipeline::llm::{CompletionClient, CompletionRequest};
use crate::pipeline::ocr::OcrService;
use crate::pipeline::storage::{ttl_to_chrono, BlobStore};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Object name used to test descriptor signing. Nothing is uploaded under it.
const SIGNING_CHECK_OBJECT: &str = "scan2epub-preflight";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Configuration,
    Storage,
    Ocr,
    Completion,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Service::Configuration => "Configuration",
            Service::Storage => "Storage",
            Service::Ocr => "OCR service",
            Service::Completion => "Completion service",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCheck {
    pub service: Service,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub checks: Vec<ServiceCheck>,
}

impl PreflightReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ServiceCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// A backend ready to check, or why it could not be built.
pub type Backend<T> = Result<Arc<T>, String>;

/// Preflight over whichever backends were supplied. Services left unset are
/// not checked.
pub struct Preflight<'a> {
    config: &'a PipelineConfig,
    storage: Option<Backend<dyn BlobStore>>,
    ocr: Option<Backend<dyn OcrService>>,
    completion: Option<Backend<dyn CompletionClient>>,
}

impl<'a> Preflight<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            storage: None,
            ocr: None,
            completion: None,
        }
    }

    pub fn storage(mut self, backend: Backend<dyn BlobStore>) -> Self {
        self.storage = Some(backend);
        self
    }

    pub fn ocr(mut self, backend: Backend<dyn OcrService>) -> Self {
        self.ocr = Some(backend);
        self
    }

    pub fn completion(mut self, backend: Backend<dyn CompletionClient>) -> Self {
        self.completion = Some(backend);
        self
    }

    /// Run every check in order and collect the results.
    pub async fn run(&self) -> PreflightReport {
        let mut report = PreflightReport::default();

        report.checks.push(
            timed(Service::Configuration, async {
                self.config.validate().map_err(|e| e.to_string())?;
                Ok::<_, String>("settings are consistent".to_string())
            })
            .await,
        );

        if let Some(backend) = &self.storage {
            report.checks.push(
                timed(Service::Storage, async {
                    let store = backend.as_ref().map_err(Clone::clone)?;
                    check_storage(&**store, self.config).await
                })
                .await,
            );
        }

        if let Some(backend) = &self.ocr {
            report.checks.push(
                timed(Service::Ocr, async {
                    let ocr = backend.as_ref().map_err(Clone::clone)?;
                    ocr.check().await.map_err(|e| e.to_string())?;
                    Ok::<_, String>(format!("{} reachable and authenticated", ocr.name()))
                })
                .await,
            );
        }

        if let Some(backend) = &self.completion {
            report.checks.push(
                timed(Service::Completion, async {
                    let client = backend.as_ref().map_err(Clone::clone)?;
                    check_completion(&**client).await
                })
                .await,
            );
        }

        let failed = report.failures().count();
        if failed == 0 {
            info!("Preflight passed: {} checks", report.checks.len());
        } else {
            warn!("Preflight: {} of {} checks failed", failed, report.checks.len());
        }
        report
    }
}

async fn check_storage(store: &dyn BlobStore, config: &PipelineConfig) -> Result<String, String> {
    let container = config.storage.container_name.as_str();
    store
        .ensure_container(container)
        .await
        .map_err(|e| e.to_string())?;
    let expires_at = Utc::now() + ttl_to_chrono(config.storage.access_ttl);
    store
        .access_descriptor(container, SIGNING_CHECK_OBJECT, expires_at)
        .map_err(|e| format!("container ready, but access signing failed: {e}"))?;
    Ok(format!("container '{container}' ready on {}", store.name()))
}

async fn check_completion(client: &dyn CompletionClient) -> Result<String, String> {
    let request = CompletionRequest {
        system: "ping".to_string(),
        user: "ok".to_string(),
        temperature: 0.0,
        max_tokens: 1,
    };
    let completion = client.complete(&request).await.map_err(|e| e.to_string())?;
    Ok(format!(
        "{} answered ({} tokens in)",
        client.name(),
        completion.input_tokens
    ))
}

async fn timed<F>(service: Service, check: F) -> ServiceCheck
where
    F: Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let result = check.await;
    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(detail) => ServiceCheck {
            service,
            passed: true,
            detail,
            duration_ms,
        },
        Err(detail) => {
            warn!("Preflight {} failed: {}", service, detail);
            ServiceCheck {
                service,
                passed: false,
                detail,
                duration_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompletionError, ScanError};
    use crate::pipeline::llm::Completion;
    use crate::pipeline::ocr::PollResponse;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Store {
        containers: Mutex<Vec<String>>,
        refuse: bool,
    }

    #[async_trait]
    impl BlobStore for Store {
        fn name(&self) -> &str {
            "memory"
        }

        async fn ensure_container(&self, container: &str) -> Result<(), ScanError> {
            if self.refuse {
                return Err(ScanError::storage_status("create container", 403, "AuthenticationFailed"));
            }
            self.containers.lock().unwrap().push(container.to_string());
            Ok(())
        }

        async fn upload(&self, _c: &str, _n: &str, _b: Vec<u8>) -> Result<String, ScanError> {
            panic!("preflight must not upload");
        }

        fn access_descriptor(
            &self,
            container: &str,
            name: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<String, ScanError> {
            Ok(format!("mem://{container}/{name}?se={}", expires_at.timestamp()))
        }

        async fn delete(&self, _c: &str, _n: &str) -> Result<(), ScanError> {
            panic!("preflight must not delete");
        }
    }

    struct Ocr {
        status: Option<u16>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl OcrService for Ocr {
        fn name(&self) -> &str {
            "fake-ocr"
        }

        async fn submit(&self, _url: &str) -> Result<String, ScanError> {
            panic!("preflight must not start a job");
        }

        async fn poll(&self, _job: &str) -> Result<PollResponse, ScanError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(PollResponse::running())
        }

        async fn check(&self) -> Result<(), ScanError> {
            match self.status {
                Some(code) => Err(ScanError::ocr_status(code, "Access denied")),
                None => Ok(()),
            }
        }
    }

    struct Echo {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionClient for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(Completion {
                text: "o".into(),
                input_tokens: 3,
                output_tokens: 1,
            })
        }
    }

    fn healthy_ocr() -> Arc<Ocr> {
        Arc::new(Ocr {
            status: None,
            polls: AtomicUsize::new(0),
        })
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            requests: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn healthy_services_pass_with_cheap_calls() {
        let config = PipelineConfig::default();
        let store = Arc::new(Store::default());
        let client = echo();

        let report = Preflight::new(&config)
            .storage(Ok(store.clone()))
            .ocr(Ok(healthy_ocr()))
            .completion(Ok(client.clone()))
            .run()
            .await;

        assert!(report.all_passed(), "{report:?}");
        let services: Vec<Service> = report.checks.iter().map(|c| c.service).collect();
        assert_eq!(
            services,
            vec![Service::Configuration, Service::Storage, Service::Ocr, Service::Completion]
        );
        assert_eq!(*store.containers.lock().unwrap(), vec!["scan2epub-temp"]);
        assert_eq!(client.requests.lock().unwrap()[0].max_tokens, 1);
    }

    #[tokio::test]
    async fn every_failure_is_reported_without_stopping_the_rest() {
        let config = PipelineConfig::default();
        let store = Arc::new(Store {
            refuse: true,
            ..Default::default()
        });
        let ocr = Arc::new(Ocr {
            status: Some(401),
            polls: AtomicUsize::new(0),
        });
        let client = echo();

        let report = Preflight::new(&config)
            .storage(Ok(store))
            .ocr(Ok(ocr.clone()))
            .completion(Ok(client.clone()))
            .run()
            .await;

        assert!(!report.all_passed());
        let failed: Vec<Service> = report.failures().map(|c| c.service).collect();
        assert_eq!(failed, vec![Service::Storage, Service::Ocr]);
        assert!(report.checks[2].detail.contains("401"));
        assert_eq!(ocr.polls.load(Ordering::SeqCst), 0);
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unbuildable_backend_and_bad_config_fail() {
        let mut config = PipelineConfig::default();
        config.cleanup.concurrency = 0;

        let report = Preflight::new(&config)
            .ocr(Err("AZURE_CU_ENDPOINT is not set".into()))
            .run()
            .await;

        assert_eq!(report.checks.len(), 2);
        assert!(!report.checks[0].passed);
        assert!(!report.checks[1].passed);
        assert_eq!(report.checks[1].detail, "AZURE_CU_ENDPOINT is not set");
    }
}
