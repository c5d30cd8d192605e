use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a background step wants next. The scheduler owns all delay and
/// re-invocation mechanics; steps stay pure decision logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Continue(Duration),
}

/// A self-rescheduling unit of background work tied to one job (readiness
/// polling, log bridging). Each invocation completes and persists its state
/// before the next one is scheduled, so a step is never in flight twice.
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &'static str;
    async fn run(&mut self) -> StepOutcome;
}

/// Cooperative scheduler for job-stage steps.
///
/// One spawned task per (job, step) pair; duplicate registration for a pair
/// that is still in flight is refused so the same stage never overlaps with
/// itself for one job.
#[derive(Default)]
pub struct StepScheduler {
    tasks: DashMap<(Uuid, &'static str), JoinHandle<()>>,
}

impl StepScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `step` for `job_id` after `initial_delay`, then keep
    /// re-invoking it until it returns `Done`. Returns false if the same
    /// step is already scheduled for this job.
    pub fn schedule(
        self: &Arc<Self>,
        job_id: Uuid,
        mut step: Box<dyn Step>,
        initial_delay: Duration,
    ) -> bool {
        let key = (job_id, step.name());

        if let Some(existing) = self.tasks.get(&key) {
            if !existing.is_finished() {
                warn!(
                    "Step {} already scheduled for job {job_id}, refusing duplicate",
                    key.1
                );
                return false;
            }
        }

        debug!(
            "Scheduling step {} for job {job_id} after {initial_delay:?}",
            key.1
        );

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                match step.run().await {
                    StepOutcome::Done => break,
                    StepOutcome::Continue(delay) => tokio::time::sleep(delay).await,
                }
            }
            debug!("Step {} for job {job_id} finished", key.1);
            scheduler.tasks.remove(&key);
        });

        self.tasks.insert(key, handle);
        true
    }

    pub fn is_scheduled(&self, job_id: Uuid, name: &'static str) -> bool {
        self.tasks
            .get(&(job_id, name))
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|e| !e.value().is_finished()).count()
    }

    /// Abort all in-flight steps. Steps are written to tolerate being cut
    /// off between invocations, so abort is safe at shutdown.
    pub fn shutdown(&self) {
        let count = self.tasks.len();
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        if count > 0 {
            info!("Step scheduler shut down, aborted {count} steps");
        }
    }
}
