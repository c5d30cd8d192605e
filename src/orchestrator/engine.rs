use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use uuid::Uuid;

use crate::orchestrator::config::OrchestratorSettings;
use crate::orchestrator::job::{
    CompletionNotifier, Job, JobLogSink, JobStatus, JobStore,
};
use crate::orchestrator::provider::CloudProvider;
use crate::orchestrator::readiness::ReadinessProbe;
use crate::orchestrator::runner::JobRunner;
use crate::orchestrator::scheduler::StepScheduler;

/// Top-level handle wiring the store, the provider seam and the runner
/// together. One engine per process; jobs run as spawned tasks under it.
pub struct Engine {
    store: Arc<dyn JobStore>,
    scheduler: Arc<StepScheduler>,
    runner: Arc<JobRunner>,
}

impl Engine {
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn JobLogSink>,
        notifier: Arc<dyn CompletionNotifier>,
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let scheduler = Arc::new(StepScheduler::new());
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            sink,
            notifier,
            provider,
            probe,
            scheduler.clone(),
            settings,
        ));
        Self {
            store,
            scheduler,
            runner,
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn runner(&self) -> Arc<JobRunner> {
        self.runner.clone()
    }

    /// Register a job and start executing it in the background.
    pub async fn submit(&self, job: Job) -> Result<Uuid> {
        let job_id = job.id;
        let mut job = job;
        job.status = JobStatus::Queued;
        self.store.insert(job).await?;
        info!("Job {job_id} queued");

        let runner = self.runner.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.execute(job_id).await {
                error!("Job {job_id} execution error: {e:#}");
            }
        });
        Ok(job_id)
    }

    /// Tear down a job's deployed resources, waiting for completion.
    pub async fn destroy_job(&self, job_id: Uuid) -> Result<()> {
        self.runner.destroy(job_id).await
    }

    /// Stop all background steps. Safe to call with work in flight; steps
    /// persist their bookkeeping every iteration.
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.scheduler.shutdown();
    }
}
