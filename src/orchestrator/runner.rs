use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::orchestrator::bootstrap::generate_bootstrap;
use crate::orchestrator::config::OrchestratorSettings;
use crate::orchestrator::credentials::{CredentialResolver, ResolvedCredentials};
use crate::orchestrator::deploy::StackDeployer;
use crate::orchestrator::image_cache::ImageCacheManager;
use crate::orchestrator::job::{
    CompletionNotifier, DeploymentKind, Job, JobLogSink, JobLogger, JobStatus, JobStore,
};
use crate::orchestrator::log_bridge::RemoteLogBridge;
use crate::orchestrator::provider::CloudProvider;
use crate::orchestrator::readiness::{ReadinessPoller, ReadinessProbe};
use crate::orchestrator::scheduler::StepScheduler;
use crate::{SOURCE_CREDENTIALS, SOURCE_DEPLOY, SOURCE_IMAGE_CACHE, SOURCE_ORCHESTRATOR};

/// Executes one provisioning (or destroy) run for a job: resolve credentials,
/// deploy the stack, record the outcome and hand the long tail of work
/// (readiness polling, log bridging) to the step scheduler.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn JobLogSink>,
    notifier: Arc<dyn CompletionNotifier>,
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn ReadinessProbe>,
    scheduler: Arc<StepScheduler>,
    resolver: CredentialResolver,
    deployer: StackDeployer,
    images: Arc<ImageCacheManager>,
    settings: OrchestratorSettings,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn JobLogSink>,
        notifier: Arc<dyn CompletionNotifier>,
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn ReadinessProbe>,
        scheduler: Arc<StepScheduler>,
        settings: OrchestratorSettings,
    ) -> Self {
        let resolver = CredentialResolver::new(provider.clone(), settings.cloud.clone());
        let deployer = StackDeployer::new(settings.tool.clone());
        // One shared manager so concurrent jobs serialize image creation
        let images = Arc::new(ImageCacheManager::new(
            provider.clone(),
            settings.image_cache.clone(),
        ));
        Self {
            store,
            sink,
            notifier,
            provider,
            probe,
            scheduler,
            resolver,
            deployer,
            images,
            settings,
        }
    }

    /// Run the provisioning pipeline for a job. Each job enters `Running`
    /// exactly once; a job in any other state than pending/queued is left
    /// alone. The startable check and the transition happen inside one
    /// store update, so concurrent callers cannot both claim the job.
    pub async fn execute(&self, job_id: Uuid) -> Result<()> {
        let claimed = Arc::new(AtomicBool::new(false));
        let flag = claimed.clone();
        let found = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    if job.status.is_startable() {
                        job.status = JobStatus::Running;
                        job.started_at = Some(Utc::now());
                        flag.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await?;
        if !found {
            warn!("Job {job_id} not found, nothing to execute");
            return Ok(());
        }
        if !claimed.load(Ordering::SeqCst) {
            warn!("Job {job_id} is not startable, refusing another execution");
            return Ok(());
        }

        let Some(job) = self.store.get(job_id).await? else {
            warn!("Job {job_id} disappeared after being claimed");
            return Ok(());
        };

        let logger = JobLogger::new(self.sink.clone(), job_id);
        logger
            .info(
                SOURCE_ORCHESTRATOR,
                &format!("Starting provisioning for job '{}'", job.name),
            )
            .await;

        match self.provision(job, &logger).await {
            Ok(()) => {}
            Err(e) => {
                let message = format!("{e:#}");
                logger
                    .error(SOURCE_ORCHESTRATOR, &format!("Provisioning failed: {message}"))
                    .await;
                self.store
                    .update(
                        job_id,
                        Box::new(move |job| {
                            job.status = JobStatus::Failed;
                            job.error_message = Some(message);
                            job.completed_at = Some(Utc::now());
                        }),
                    )
                    .await?;
                self.notify(job_id, &logger).await;
            }
        }
        Ok(())
    }

    async fn provision(&self, mut job: Job, logger: &JobLogger) -> Result<()> {
        let creds = self.resolve_credentials(&mut job, logger).await?;

        self.substitute_cached_image(&mut job, &creds, logger).await;
        self.verify_vpc(&mut job, &creds, logger).await;

        // Configured default image applies only when neither the job nor the
        // cache picked one; it is a deploy-time fallback, not job state.
        if job.image_id.is_none() && job.cached_image_used.is_none() {
            job.image_id = self.settings.software.default_image_id.clone();
        }

        let user_data = generate_bootstrap(
            &job,
            &self.settings.software,
            job.cached_image_used.is_some(),
        );

        logger
            .info(SOURCE_DEPLOY, "Synthesizing deployment stack")
            .await;
        self.deployer
            .synthesize(&job, &creds, &user_data, logger)
            .await?;

        logger.info(SOURCE_DEPLOY, "Applying deployment stack").await;
        let outputs = self.deployer.apply(&job, &creds, &user_data, logger).await?;

        let recorded = outputs.clone();
        self.store
            .update(
                job.id,
                Box::new(move |job| {
                    job.outputs = recorded;
                    job.status = JobStatus::Success;
                    job.completed_at = Some(Utc::now());
                }),
            )
            .await?;
        job.outputs = outputs;

        logger
            .info(
                SOURCE_ORCHESTRATOR,
                &format!(
                    "Deployment complete; instance {} at {}",
                    job.outputs.instance_id.as_deref().unwrap_or("unknown"),
                    job.outputs.public_ip.as_deref().unwrap_or("no public address"),
                ),
            )
            .await;

        // Script deployments finish here; only stack deployments get the
        // post-deployment background steps.
        if job.kind == DeploymentKind::Stack {
            self.schedule_post_deploy(&job, &creds, logger).await;
        }

        self.notify(job.id, logger).await;
        Ok(())
    }

    async fn resolve_credentials(
        &self,
        job: &mut Job,
        logger: &JobLogger,
    ) -> Result<ResolvedCredentials> {
        let (creds, identity) = self.resolver.resolve(&job.auth, &job.region).await?;
        logger
            .info(
                SOURCE_CREDENTIALS,
                &format!("Acting as {} in account {}", identity.arn, identity.account_id),
            )
            .await;

        let account_id = identity.account_id.clone();
        self.store
            .update(job.id, Box::new(move |job| job.account_id = Some(account_id)))
            .await?;
        job.account_id = Some(identity.account_id);
        Ok(creds)
    }

    /// Swap in a cached image for this software version when the job allows
    /// it and no explicit image was requested.
    async fn substitute_cached_image(
        &self,
        job: &mut Job,
        creds: &ResolvedCredentials,
        logger: &JobLogger,
    ) {
        if !job.use_cached_image || job.image_id.is_some() {
            return;
        }

        match self.images.find_cached(creds, &job.software_version).await {
            Ok(Some(image_id)) => {
                logger
                    .info(
                        SOURCE_IMAGE_CACHE,
                        &format!(
                            "Using cached image {image_id} for version {}",
                            job.software_version
                        ),
                    )
                    .await;
                let recorded = image_id.clone();
                let _ = self
                    .store
                    .update(
                        job.id,
                        Box::new(move |job| job.cached_image_used = Some(recorded)),
                    )
                    .await;
                job.cached_image_used = Some(image_id);
            }
            Ok(None) => {
                logger
                    .info(
                        SOURCE_IMAGE_CACHE,
                        &format!(
                            "No cached image for version {}, performing a full install",
                            job.software_version
                        ),
                    )
                    .await;
            }
            Err(e) => {
                // Cache lookup trouble never blocks provisioning
                logger
                    .warning(SOURCE_IMAGE_CACHE, &format!("Cached image lookup failed: {e}"))
                    .await;
            }
        }
    }

    /// Confirm a requested vpc actually exists; when it does not (or the
    /// check itself fails) fall back to letting the stack create one rather
    /// than failing the deployment on a stale reference.
    async fn verify_vpc(&self, job: &mut Job, creds: &ResolvedCredentials, logger: &JobLogger) {
        let Some(vpc_id) = job.vpc_id.clone() else {
            return;
        };

        let exists = match self.provider.vpc_exists(creds, &vpc_id).await {
            Ok(exists) => exists,
            Err(e) => {
                logger
                    .warning(
                        SOURCE_ORCHESTRATOR,
                        &format!("Could not verify vpc {vpc_id}: {e}"),
                    )
                    .await;
                false
            }
        };

        if !exists {
            logger
                .warning(
                    SOURCE_ORCHESTRATOR,
                    &format!("vpc {vpc_id} not found; the stack will create its own network"),
                )
                .await;
            let _ = self
                .store
                .update(job.id, Box::new(|job| job.vpc_id = None))
                .await;
            job.vpc_id = None;
        }
    }

    async fn schedule_post_deploy(
        &self,
        job: &Job,
        creds: &ResolvedCredentials,
        logger: &JobLogger,
    ) {
        let bridge = RemoteLogBridge::new(
            self.store.clone(),
            self.provider.clone(),
            logger.clone(),
            creds.clone(),
            self.settings.log_bridge.clone(),
            job.id,
        );
        self.scheduler
            .schedule(job.id, Box::new(bridge), self.settings.log_bridge.interval());

        let poller = ReadinessPoller::new(
            self.store.clone(),
            self.provider.clone(),
            self.probe.clone(),
            logger.clone(),
            creds.clone(),
            self.settings.readiness.clone(),
            self.images.clone(),
            &self.settings.log_bridge,
            job.id,
        );
        self.scheduler
            .schedule(job.id, Box::new(poller), self.settings.readiness.warmup());

        logger
            .info(
                SOURCE_ORCHESTRATOR,
                &format!(
                    "Scheduled readiness polling (starts in {}s) and instance log bridging",
                    self.settings.readiness.warmup_secs
                ),
            )
            .await;
    }

    /// Tear down everything the job deployed. The stack name is recomputed
    /// from the job id, so this works even for jobs that failed mid-apply.
    pub async fn destroy(&self, job_id: Uuid) -> Result<()> {
        let Some(mut job) = self
            .store
            .get(job_id)
            .await?
            .filter(|j| j.status != JobStatus::Destroyed)
        else {
            warn!("Job {job_id} not found or already destroyed");
            return Ok(());
        };

        let logger = JobLogger::new(self.sink.clone(), job_id);
        logger
            .info(SOURCE_ORCHESTRATOR, "Destroying deployed resources")
            .await;

        let creds = self.resolve_credentials(&mut job, &logger).await?;
        self.deployer.destroy(&job, &creds, &logger).await?;

        self.store
            .update(
                job_id,
                Box::new(|job| {
                    job.status = JobStatus::Destroyed;
                    job.completed_at = Some(Utc::now());
                }),
            )
            .await?;
        logger
            .info(SOURCE_ORCHESTRATOR, "All deployed resources removed")
            .await;
        Ok(())
    }

    async fn notify(&self, job_id: Uuid, logger: &JobLogger) {
        let Ok(Some(job)) = self.store.get(job_id).await else {
            return;
        };
        let excerpt = logger.excerpt().await;
        if let Err(e) = self.notifier.notify(&job, &excerpt).await {
            // Notification failures never change the job outcome
            logger
                .warning(
                    SOURCE_ORCHESTRATOR,
                    &format!("Completion notification failed: {e}"),
                )
                .await;
        }
    }

    /// Give the in-flight readiness poll a chance to settle in tests and in
    /// graceful shutdown paths.
    pub async fn wait_for_steps(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        while self.scheduler.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
