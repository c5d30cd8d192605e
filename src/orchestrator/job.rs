use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lifecycle of a provisioning job.
///
/// `Pending -> Queued -> Running -> {Success, Failed}`; `Destroyed` is set by
/// the explicit destroy operation, never by the provisioning path. A job
/// enters `Running` exactly once per execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Destroyed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Destroyed
        )
    }

    /// Whether the orchestrator may start an execution attempt from this state.
    pub fn is_startable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Destroyed => "destroyed",
        }
    }
}

/// Machine image cache bookkeeping for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    #[default]
    None,
    Creating,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// Declarative stack deployment through the supervised IaC tool. The
    /// actively maintained path; gets the log bridge and readiness poller.
    Stack,
    /// Legacy script-based deployment. Same executor contract, no
    /// post-deployment background steps.
    Script,
}

/// How the job authenticates against the cloud provider. Static secrets are
/// only ever held for the duration of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AuthMethod {
    AssumeRole {
        role_arn: Option<String>,
        external_id: Option<String>,
        session_name: Option<String>,
    },
    StaticKeys {
        access_key_id: String,
        secret_access_key: String,
    },
}

/// Typed deployment outputs plus the raw passthrough map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutputs {
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub kind: DeploymentKind,
    pub region: String,
    pub auth: AuthMethod,

    // Network placement; a missing vpc means the deployment tool creates one
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,

    // Compute shape
    pub instance_type: String,
    pub volume_size_gb: u32,
    pub image_id: Option<String>,
    pub use_cached_image: bool,
    pub key_pair_name: Option<String>,

    pub software_version: String,
    pub tags: HashMap<String, String>,

    // Resolved during execution
    pub account_id: Option<String>,
    pub outputs: JobOutputs,

    // Image cache bookkeeping
    pub created_image_id: Option<String>,
    pub image_status: ImageStatus,
    pub image_error: Option<String>,
    /// Cached image substituted before deployment, if any. A job that booted
    /// from a cached image never creates another one for the same version.
    pub cached_image_used: Option<String>,

    // Readiness bookkeeping
    pub ready: bool,
    pub check_attempts: u32,
    pub last_checked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(name: &str, region: &str, auth: AuthMethod) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: JobStatus::Pending,
            kind: DeploymentKind::Stack,
            region: region.to_string(),
            auth,
            vpc_id: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            instance_type: "t3.medium".to_string(),
            volume_size_gb: 100,
            image_id: None,
            use_cached_image: false,
            key_pair_name: None,
            software_version: "0.0.0".to_string(),
            tags: HashMap::new(),
            account_id: None,
            outputs: JobOutputs::default(),
            created_image_id: None,
            image_status: ImageStatus::None,
            image_error: None,
            cached_image_used: None,
            ready: false,
            check_attempts: 0,
            last_checked_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// One append-only log line belonging to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

/// Persistence seam for job records. All mutations go through `update` so the
/// store can implement a single-row read-modify-write cycle.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;
    /// Apply `mutate` to the stored record. Returns false when the job no
    /// longer exists (e.g. deleted by the owning collaborator mid-poll).
    /// The closure is higher-ranked over the borrow so implementations can
    /// hand it a guard-scoped reference.
    async fn update(
        &self,
        id: Uuid,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Job) + Send>,
    ) -> Result<bool>;
}

/// Append-only sink for job log entries. The orchestrator never reads its own
/// writes back; the notifier excerpt comes from an in-process tail instead.
#[async_trait]
pub trait JobLogSink: Send + Sync {
    async fn append(&self, entry: JobLogEntry) -> Result<()>;
}

/// Invoked once per job with the final status. Failure to notify must never
/// fail the job.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, job: &Job, log_excerpt: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<Uuid, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn update(
        &self,
        id: Uuid,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Job) + Send>,
    ) -> Result<bool> {
        match self.jobs.get_mut(&id) {
            Some(mut job) => {
                mutate(&mut job);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-memory sink, used by tests and by the standalone binary.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: DashMap<Uuid, Vec<JobLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, job_id: Uuid) -> Vec<JobLogEntry> {
        self.entries
            .get(&job_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobLogSink for MemoryLogSink {
    async fn append(&self, entry: JobLogEntry) -> Result<()> {
        self.entries.entry(entry.job_id).or_default().push(entry);
        Ok(())
    }
}

/// Notifier that only writes to the process log. The real notification
/// channel (email) lives outside the orchestrator.
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, job: &Job, log_excerpt: &str) -> Result<()> {
        info!(
            "Job {} ({}) finished with status {}; instance={:?} public_ip={:?}",
            job.id,
            job.name,
            job.status.as_str(),
            job.outputs.instance_id,
            job.outputs.public_ip,
        );
        debug!("Job {} log excerpt:\n{}", job.id, log_excerpt);
        Ok(())
    }
}

const EXCERPT_LINES: usize = 20;
const EXCERPT_MAX_CHARS: usize = 500;

/// Per-job logging handle shared by all components working on one job.
///
/// Writes every line to the sink and mirrors it to the process log. Keeps a
/// bounded tail in memory so the completion notifier can include an excerpt
/// without reading the sink back.
#[derive(Clone)]
pub struct JobLogger {
    sink: Arc<dyn JobLogSink>,
    job_id: Uuid,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl JobLogger {
    pub fn new(sink: Arc<dyn JobLogSink>, job_id: Uuid) -> Self {
        Self {
            sink,
            job_id,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(EXCERPT_LINES))),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn log(&self, level: LogLevel, source: &str, message: &str) {
        let entry = JobLogEntry {
            job_id: self.job_id,
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.to_string(),
        };

        match level {
            LogLevel::Debug => debug!("Job {}: {message}", self.job_id),
            LogLevel::Info => info!("Job {}: {message}", self.job_id),
            LogLevel::Warning => warn!("Job {}: {message}", self.job_id),
            LogLevel::Error => error!("Job {}: {message}", self.job_id),
        }

        {
            let mut tail = self.tail.lock().await;
            if tail.len() == EXCERPT_LINES {
                tail.pop_front();
            }
            tail.push_back(format!(
                "[{}] [{}] {message}",
                entry.timestamp.format("%H:%M:%S"),
                level.as_str()
            ));
        }

        if let Err(e) = self.sink.append(entry).await {
            error!("Failed to append log entry for job {}: {e}", self.job_id);
        }
    }

    pub async fn info(&self, source: &str, message: &str) {
        self.log(LogLevel::Info, source, message).await;
    }

    pub async fn warning(&self, source: &str, message: &str) {
        self.log(LogLevel::Warning, source, message).await;
    }

    pub async fn error(&self, source: &str, message: &str) {
        self.log(LogLevel::Error, source, message).await;
    }

    /// Recent log tail for the completion notification, truncated the same
    /// way the notification channel truncates it.
    pub async fn excerpt(&self) -> String {
        let tail = self.tail.lock().await;
        let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > EXCERPT_MAX_CHARS {
            joined.chars().take(EXCERPT_MAX_CHARS).collect()
        } else {
            joined
        }
    }
}
