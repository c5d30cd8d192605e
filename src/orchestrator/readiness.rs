use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::orchestrator::config::{LogBridgeSettings, ReadinessSettings};
use crate::orchestrator::credentials::ResolvedCredentials;
use crate::orchestrator::image_cache::{ImageCacheManager, ImageOutcome};
use crate::orchestrator::job::{ImageStatus, Job, JobLogger, JobStatus, JobStore};
use crate::orchestrator::provider::CloudProvider;
use crate::orchestrator::scheduler::{Step, StepOutcome};
use crate::{SOURCE_IMAGE_CACHE, SOURCE_READINESS};

/// Why a single probe attempt concluded the service is not up yet. Carries
/// enough detail for the job log to distinguish a booting instance from a
/// misconfigured one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Dns,
    ConnectionRefused,
    Tls,
    Status(u16),
    UnexpectedContent,
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "request timed out"),
            ProbeFailure::Dns => write!(f, "hostname did not resolve"),
            ProbeFailure::ConnectionRefused => write!(f, "connection refused"),
            ProbeFailure::Tls => write!(f, "TLS handshake failed"),
            ProbeFailure::Status(code) => write!(f, "HTTP status {code}"),
            ProbeFailure::UnexpectedContent => {
                write!(f, "HTTP 200 but the response body is not the expected page")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Ready,
    NotReady(ProbeFailure),
}

/// A 200 response only counts as ready when the body carries the marker; a
/// reverse proxy answering 200 with an error page stays not-ready.
pub fn classify_response(status: u16, body: &str, marker: &str) -> ProbeResult {
    if status != 200 {
        return ProbeResult::NotReady(ProbeFailure::Status(status));
    }
    if body.to_lowercase().contains(&marker.to_lowercase()) {
        ProbeResult::Ready
    } else {
        ProbeResult::NotReady(ProbeFailure::UnexpectedContent)
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// HTTPS probe against the instance's public address. Certificate
/// verification is off: freshly provisioned instances serve a self-signed
/// certificate until real ones are issued, and reachability is what is being
/// measured here.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    marker: String,
}

impl HttpReadinessProbe {
    pub fn new(settings: &ReadinessSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(settings.probe_timeout())
            .build()?;
        Ok(Self {
            client,
            marker: settings.marker.clone(),
        })
    }

    fn classify_error(err: &reqwest::Error) -> ProbeFailure {
        if err.is_timeout() {
            return ProbeFailure::Timeout;
        }
        let text = err.to_string();
        if text.contains("dns") || text.contains("resolve") {
            ProbeFailure::Dns
        } else if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            ProbeFailure::Tls
        } else {
            ProbeFailure::ConnectionRefused
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        let url = format!("https://{address}/");
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                classify_response(status, &body, &self.marker)
            }
            Err(err) => ProbeResult::NotReady(Self::classify_error(&err)),
        }
    }
}

// Commands run on the instance when polling gives up, to leave a snapshot of
// its state in the job log.
const DIAGNOSTIC_COMMANDS: &[&str] = &[
    "ps aux | head -n 25",
    "df -h",
    "free -m",
    "tail -n 50 /var/log/skiff-deploy.log",
];

/// Background step that polls one instance until its service answers, then
/// triggers cached-image creation.
///
/// Every iteration re-reads the job record and persists its bookkeeping
/// before yielding, so the poller survives losing the race with a concurrent
/// destroy: it simply finds the job gone or terminal and stops.
pub struct ReadinessPoller {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn ReadinessProbe>,
    logger: JobLogger,
    creds: ResolvedCredentials,
    settings: ReadinessSettings,
    images: Arc<ImageCacheManager>,
    remote_timeout: Duration,
    job_id: Uuid,
}

impl ReadinessPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn ReadinessProbe>,
        logger: JobLogger,
        creds: ResolvedCredentials,
        settings: ReadinessSettings,
        images: Arc<ImageCacheManager>,
        log_bridge: &LogBridgeSettings,
        job_id: Uuid,
    ) -> Self {
        Self {
            store,
            provider,
            probe,
            logger,
            creds,
            settings,
            images,
            remote_timeout: log_bridge.remote_command_timeout(),
            job_id,
        }
    }

    async fn record_attempt(&self, ready: bool) {
        let _ = self
            .store
            .update(
                self.job_id,
                Box::new(move |job| {
                    job.check_attempts += 1;
                    job.last_checked_at = Some(chrono::Utc::now());
                    if ready {
                        job.ready = true;
                    }
                }),
            )
            .await;
    }

    /// One log entry when the attempt budget is spent, plus a best-effort
    /// remote snapshot of the instance. Never retried after this.
    async fn give_up(&self, job: &Job) {
        self.logger
            .error(
                SOURCE_READINESS,
                &format!(
                    "Service did not become ready after {} checks; giving up",
                    job.check_attempts
                ),
            )
            .await;

        let Some(instance_id) = job.outputs.instance_id.as_deref() else {
            return;
        };
        let commands: Vec<String> = DIAGNOSTIC_COMMANDS.iter().map(|c| c.to_string()).collect();
        match self
            .provider
            .run_remote_command(&self.creds, instance_id, &commands, self.remote_timeout)
            .await
        {
            Ok(output) => {
                self.logger
                    .info(
                        SOURCE_READINESS,
                        &format!("Instance diagnostics:\n{}", output.stdout),
                    )
                    .await;
            }
            Err(e) => {
                debug!(
                    "Job {}: diagnostics collection failed: {e}",
                    self.job_id
                );
            }
        }
    }

    /// Record the cached-image outcome once the service is up. A job that
    /// booted from a cached image records `Skipped` without creating; a job
    /// that never asked for caching records nothing.
    async fn trigger_image_capture(&self, job: &Job) {
        if let Some(reused) = &job.cached_image_used {
            let reused = reused.clone();
            let _ = self
                .store
                .update(
                    self.job_id,
                    Box::new(move |job| {
                        job.image_status = ImageStatus::Skipped;
                        job.created_image_id = Some(reused);
                    }),
                )
                .await;
            self.logger
                .info(
                    SOURCE_IMAGE_CACHE,
                    "Instance booted from a cached image; not creating another one",
                )
                .await;
            return;
        }

        if !job.use_cached_image {
            return;
        }
        let Some(instance_id) = job.outputs.instance_id.clone() else {
            self.logger
                .warning(
                    SOURCE_IMAGE_CACHE,
                    "Image capture requested but no instance id is recorded",
                )
                .await;
            return;
        };

        let _ = self
            .store
            .update(
                self.job_id,
                Box::new(|job| job.image_status = ImageStatus::Creating),
            )
            .await;
        self.logger
            .info(SOURCE_IMAGE_CACHE, "Creating cached image from instance")
            .await;

        let result = self
            .images
            .create_from_instance(
                &self.creds,
                &instance_id,
                &job.software_version,
                &self.job_id.to_string(),
            )
            .await;

        match result {
            Ok(ImageOutcome::Created(image_id)) => {
                self.logger
                    .info(SOURCE_IMAGE_CACHE, &format!("Cached image {image_id} is available"))
                    .await;
                let _ = self
                    .store
                    .update(
                        self.job_id,
                        Box::new(move |job| {
                            job.image_status = ImageStatus::Completed;
                            job.created_image_id = Some(image_id);
                        }),
                    )
                    .await;
            }
            Ok(ImageOutcome::Skipped(image_id)) => {
                self.logger
                    .info(
                        SOURCE_IMAGE_CACHE,
                        &format!("Cached image {image_id} already exists for this version"),
                    )
                    .await;
                let _ = self
                    .store
                    .update(
                        self.job_id,
                        Box::new(move |job| {
                            job.image_status = ImageStatus::Skipped;
                            job.created_image_id = Some(image_id);
                        }),
                    )
                    .await;
            }
            Err(e) => {
                self.logger
                    .error(SOURCE_IMAGE_CACHE, &format!("Image creation failed: {e}"))
                    .await;
                let message = e.to_string();
                let _ = self
                    .store
                    .update(
                        self.job_id,
                        Box::new(move |job| {
                            job.image_status = ImageStatus::Failed;
                            job.image_error = Some(message);
                        }),
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl Step for ReadinessPoller {
    fn name(&self) -> &'static str {
        "readiness"
    }

    async fn run(&mut self) -> StepOutcome {
        let job = match self.store.get(self.job_id).await {
            Ok(Some(job)) => job,
            // Gone or unreadable; nothing left to poll for
            _ => return StepOutcome::Done,
        };
        // Success is the normal state while polling; only a failed or
        // destroyed job ends the poll early.
        if job.ready || matches!(job.status, JobStatus::Failed | JobStatus::Destroyed) {
            return StepOutcome::Done;
        }
        if job.check_attempts >= self.settings.max_attempts {
            self.give_up(&job).await;
            return StepOutcome::Done;
        }

        let Some(address) = job.outputs.public_ip.clone() else {
            self.record_attempt(false).await;
            self.logger
                .warning(
                    SOURCE_READINESS,
                    "No public address recorded for this deployment; cannot probe yet",
                )
                .await;
            return StepOutcome::Continue(self.settings.interval());
        };

        match self.probe.probe(&address).await {
            ProbeResult::Ready => {
                self.record_attempt(true).await;
                self.logger
                    .info(
                        SOURCE_READINESS,
                        &format!("Service at {address} is ready (attempt {})", job.check_attempts + 1),
                    )
                    .await;

                // Re-read so the capture sees the attempt bookkeeping
                if let Ok(Some(job)) = self.store.get(self.job_id).await {
                    self.trigger_image_capture(&job).await;
                }
                StepOutcome::Done
            }
            ProbeResult::NotReady(failure) => {
                self.record_attempt(false).await;
                self.logger
                    .info(
                        SOURCE_READINESS,
                        &format!(
                            "Not ready yet (attempt {}/{}): {failure}",
                            job.check_attempts + 1,
                            self.settings.max_attempts
                        ),
                    )
                    .await;
                StepOutcome::Continue(self.settings.interval())
            }
        }
    }
}
