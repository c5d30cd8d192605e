use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::orchestrator::config::LogBridgeSettings;
use crate::orchestrator::credentials::ResolvedCredentials;
use crate::orchestrator::job::{JobLogger, JobStatus, JobStore};
use crate::orchestrator::provider::CloudProvider;
use crate::orchestrator::scheduler::{Step, StepOutcome};
use crate::SOURCE_INSTANCE;

/// Background step that mirrors the instance's deployment log into the job
/// log while the deployment is still coming up.
///
/// Incremental reads are driven by a marker file kept on the instance itself
/// (keyed by job id, so several orchestrated jobs never clobber each other's
/// cursors). Each round ships only the lines past the marker. Remote command
/// failures are treated as "no new output": the instance may still be
/// booting its agent.
pub struct RemoteLogBridge {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn CloudProvider>,
    logger: JobLogger,
    creds: ResolvedCredentials,
    settings: LogBridgeSettings,
    job_id: Uuid,
    iterations: u32,
}

impl RemoteLogBridge {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn CloudProvider>,
        logger: JobLogger,
        creds: ResolvedCredentials,
        settings: LogBridgeSettings,
        job_id: Uuid,
    ) -> Self {
        Self {
            store,
            provider,
            logger,
            creds,
            settings,
            job_id,
            iterations: 0,
        }
    }

    /// Shell snippet that prints only the lines appended since the last
    /// round, then advances the marker.
    fn tail_script(&self) -> String {
        let log_path = &self.settings.remote_log_path;
        let marker = format!("/tmp/skiff-log-cursor-{}", self.job_id);
        format!(
            "last=$(cat {marker} 2>/dev/null || echo 0); \
             total=$(wc -l < {log_path} 2>/dev/null || echo 0); \
             if [ \"$total\" -gt \"$last\" ]; then tail -n +$((last + 1)) {log_path}; fi; \
             echo \"$total\" > {marker}"
        )
    }
}

#[async_trait]
impl Step for RemoteLogBridge {
    fn name(&self) -> &'static str {
        "log-bridge"
    }

    async fn run(&mut self) -> StepOutcome {
        self.iterations += 1;
        if self.iterations > self.settings.max_iterations {
            debug!("Job {}: log bridge iteration budget spent", self.job_id);
            return StepOutcome::Done;
        }

        let job = match self.store.get(self.job_id).await {
            Ok(Some(job)) => job,
            _ => return StepOutcome::Done,
        };
        // Once the service is up (or the job failed or was destroyed) the
        // bridge's work is done. Success alone keeps it running; the service
        // is still booting at that point.
        if job.ready || matches!(job.status, JobStatus::Failed | JobStatus::Destroyed) {
            return StepOutcome::Done;
        }

        let Some(instance_id) = job.outputs.instance_id.as_deref() else {
            return StepOutcome::Continue(self.settings.interval());
        };

        let commands = vec![self.tail_script()];
        match self
            .provider
            .run_remote_command(
                &self.creds,
                instance_id,
                &commands,
                self.settings.remote_command_timeout(),
            )
            .await
        {
            Ok(output) => {
                for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
                    self.logger.info(SOURCE_INSTANCE, line).await;
                }
            }
            Err(e) => {
                debug!("Job {}: remote log read produced nothing: {e}", self.job_id);
            }
        }

        StepOutcome::Continue(self.settings.interval())
    }
}
