#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use skiff::orchestrator::config::{
    CloudSettings, ImageCacheSettings, LogBridgeSettings, OrchestratorSettings,
    ReadinessSettings, SoftwareSettings, ToolSettings,
};
use skiff::orchestrator::credentials::{CallerIdentity, ResolvedCredentials};
use skiff::orchestrator::job::{CompletionNotifier, Job, JobStatus};
use skiff::orchestrator::provider::{CloudProvider, ImageDescription, RemoteCommandOutput};
use skiff::orchestrator::readiness::{ProbeResult, ReadinessProbe};
use skiff::TAG_SOFTWARE_VERSION;

/// In-memory provider double. Images live in a shared map so several
/// components (and several jobs) observe the same provider state.
#[derive(Default)]
pub struct MockProvider {
    images: DashMap<String, (ImageDescription, String)>,
    pub create_image_calls: AtomicU32,
    pub remote_command_calls: AtomicU32,
    pub vpc_exists_response: Option<bool>,
    pub remote_stdout: std::sync::Mutex<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            remote_stdout: std::sync::Mutex::new("remote line".to_string()),
            ..Self::default()
        }
    }

    pub fn seed_image(&self, image_id: &str, version_tag: &str, state: &str) {
        self.images.insert(
            image_id.to_string(),
            (
                ImageDescription {
                    image_id: image_id.to_string(),
                    state: state.to_string(),
                    created_at: Utc::now(),
                },
                version_tag.to_string(),
            ),
        );
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn assume_role(
        &self,
        _base: &ResolvedCredentials,
        _role_arn: &str,
        _session_name: &str,
        _external_id: Option<&str>,
        region: &str,
    ) -> Result<ResolvedCredentials> {
        Ok(ResolvedCredentials {
            access_key_id: "ASIAMOCK".to_string(),
            secret_access_key: "mock-secret".to_string(),
            session_token: Some("mock-token".to_string()),
            expiration: Some(Utc::now() + chrono::Duration::hours(1)),
            region: region.to_string(),
        })
    }

    async fn caller_identity(&self, _creds: &ResolvedCredentials) -> Result<CallerIdentity> {
        Ok(CallerIdentity {
            account_id: "123456789012".to_string(),
            arn: "arn:aws:iam::123456789012:user/mock".to_string(),
            user_id: "AIDAMOCK".to_string(),
        })
    }

    async fn find_images(
        &self,
        _creds: &ResolvedCredentials,
        tag_filters: &HashMap<String, String>,
    ) -> Result<Vec<ImageDescription>> {
        let wanted = tag_filters.get(TAG_SOFTWARE_VERSION);
        Ok(self
            .images
            .iter()
            .filter(|entry| wanted.map_or(true, |v| entry.value().1 == *v))
            .map(|entry| entry.value().0.clone())
            .collect())
    }

    async fn create_image(
        &self,
        _creds: &ResolvedCredentials,
        _instance_id: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        let n = self.create_image_calls.fetch_add(1, Ordering::SeqCst);
        let image_id = format!("ami-mock{n}-{name}");
        self.seed_image(
            &image_id,
            tags.get(TAG_SOFTWARE_VERSION).map(String::as_str).unwrap_or(""),
            "available",
        );
        Ok(image_id)
    }

    async fn image_state(&self, _creds: &ResolvedCredentials, image_id: &str) -> Result<String> {
        self.images
            .get(image_id)
            .map(|entry| entry.value().0.state.clone())
            .ok_or_else(|| anyhow::anyhow!("image {image_id} not found"))
    }

    async fn vpc_exists(&self, _creds: &ResolvedCredentials, _vpc_id: &str) -> Result<bool> {
        Ok(self.vpc_exists_response.unwrap_or(true))
    }

    async fn run_remote_command(
        &self,
        _creds: &ResolvedCredentials,
        _instance_id: &str,
        _commands: &[String],
        _timeout: Duration,
    ) -> Result<RemoteCommandOutput> {
        self.remote_command_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteCommandOutput {
            stdout: self.remote_stdout.lock().unwrap().clone(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Probe double fed with a script of results; once the script runs out it
/// keeps answering with the last configured fallback.
pub struct MockProbe {
    script: Mutex<VecDeque<ProbeResult>>,
    fallback: ProbeResult,
    pub calls: AtomicU32,
}

impl MockProbe {
    pub fn always_ready() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ProbeResult::Ready,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_script(script: Vec<ProbeResult>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for MockProbe {
    async fn probe(&self, _address: &str) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Notifier double remembering every notification it was handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: std::sync::Mutex<Vec<(JobStatus, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<(JobStatus, String)> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, job: &Job, log_excerpt: &str) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((job.status, log_excerpt.to_string()));
        Ok(())
    }
}

/// Stand-in for the IaC tool: echoes its verb and, when asked for an outputs
/// file, writes one keyed by the stack name it was handed via the
/// environment. The `fail_verb` variant exits non-zero on that verb.
pub fn write_fake_tool(dir: &Path, fail_verb: Option<&str>) -> PathBuf {
    let path = dir.join("fake-tool.sh");
    let fail_check = match fail_verb {
        Some(verb) => format!(
            "if [ \"$verb\" = \"{verb}\" ]; then echo \"{verb} blew up\" 1>&2; exit 1; fi\n"
        ),
        None => String::new(),
    };
    let script = format!(
        r#"#!/bin/sh
verb="$1"
echo "tool: $verb $SKIFF_STACK_NAME"
printf '%s\n' "$@" >> "$(dirname "$0")/tool-args.log"
{fail_check}outfile=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--outputs-file" ]; then outfile="$a"; fi
  prev="$a"
done
if [ -n "$outfile" ]; then
  printf '{{"%s": {{"InstanceId": "i-0123456789abcdef0", "PublicIP": "203.0.113.10", "PrivateIP": "10.0.0.5"}}}}' "$SKIFF_STACK_NAME" > "$outfile"
fi
exit 0
"#
    );
    std::fs::write(&path, script).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Every argument the fake tool has been invoked with, one per line.
pub fn recorded_tool_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("tool-args.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Settings tuned for fast tests: warmup off, one-second intervals.
pub fn test_settings(app_dir: &Path, tool_path: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        region: "us-west-2".to_string(),
        tool: ToolSettings {
            program: tool_path.to_string_lossy().to_string(),
            base_args: Vec::new(),
            app_dir: app_dir.to_path_buf(),
            synth_timeout_secs: 10,
            apply_timeout_secs: 20,
            destroy_timeout_secs: 10,
            silence_notice_secs: 30,
        },
        cloud: CloudSettings::default(),
        software: SoftwareSettings {
            package_url: "https://downloads.example.com/install.sh".to_string(),
            default_image_id: None,
        },
        image_cache: ImageCacheSettings {
            poll_interval_secs: 1,
            create_timeout_secs: 10,
        },
        readiness: ReadinessSettings {
            marker: "login".to_string(),
            warmup_secs: 0,
            interval_secs: 1,
            max_attempts: 90,
            probe_timeout_secs: 5,
        },
        log_bridge: LogBridgeSettings {
            interval_secs: 1,
            max_iterations: 5,
            remote_log_path: "/var/log/skiff-deploy.log".to_string(),
            remote_command_timeout_secs: 5,
        },
    }
}

pub fn static_key_job(name: &str, version: &str) -> Job {
    let mut job = Job::new(
        name,
        "us-west-2",
        skiff::orchestrator::job::AuthMethod::StaticKeys {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "test-secret".to_string(),
        },
    );
    job.software_version = version.to_string();
    job
}

/// Poll the store until the job reaches a terminal status. The short settle
/// pause lets the runner finish the work that follows the status write
/// (scheduling background steps, notifying) before the caller asserts on it.
pub async fn wait_for_terminal(
    store: &Arc<dyn skiff::orchestrator::job::JobStore>,
    job_id: uuid::Uuid,
    max_wait: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if let Some(job) = store.get(job_id).await.unwrap() {
            if job.status.is_terminal() {
                tokio::time::sleep(Duration::from_millis(300)).await;
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not settle within {max_wait:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
