use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::orchestrator::command::{self, CommandError, CommandSpec};
use crate::orchestrator::config::ToolSettings;
use crate::orchestrator::credentials::ResolvedCredentials;
use crate::orchestrator::job::{Job, JobLogger, JobOutputs};
use crate::SOURCE_DEPLOY;

/// Deterministic stack name for a job. Destroy recomputes the same name from
/// the job id alone, so no extra state needs to survive between the two.
pub fn stack_name(job_id: Uuid) -> String {
    format!("skiff-job-{job_id}")
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("stack synthesis failed: {0}")]
    Synthesis(String),
    #[error("stack apply failed: {0}")]
    Apply(String),
    #[error("stack destroy failed: {0}")]
    Destroy(String),
}

/// Removes the per-job context artifact when the deployment phase ends,
/// whether it succeeded or not.
struct ContextFileGuard {
    path: PathBuf,
}

impl Drop for ContextFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove context file {:?}: {e}", self.path);
            }
        }
    }
}

/// Drives the IaC tool subprocess through synth, apply and destroy for one
/// stack, streaming its merged output into the job log.
pub struct StackDeployer {
    tool: ToolSettings,
}

impl StackDeployer {
    pub fn new(tool: ToolSettings) -> Self {
        Self { tool }
    }

    /// Validate the stack template without touching any resources.
    pub async fn synthesize(
        &self,
        job: &Job,
        creds: &ResolvedCredentials,
        user_data: &str,
        logger: &JobLogger,
    ) -> Result<(), DeployError> {
        let stack = stack_name(job.id);
        let _guard = self
            .write_context_file(job, user_data)
            .map_err(|e| DeployError::Synthesis(e.to_string()))?;

        let spec = self
            .base_spec(creds, &stack, self.tool.synth_timeout())
            .arg("synth")
            .args(context_args(job, user_data, &stack));

        self.run_logged(spec, logger)
            .await
            .map_err(|e| DeployError::Synthesis(e.to_string()))?;
        Ok(())
    }

    /// Deploy the stack and collect its outputs. A deployment whose outputs
    /// file never materializes is still a success; the outputs stay empty and
    /// the gap is logged.
    pub async fn apply(
        &self,
        job: &Job,
        creds: &ResolvedCredentials,
        user_data: &str,
        logger: &JobLogger,
    ) -> Result<JobOutputs, DeployError> {
        let stack = stack_name(job.id);
        let outputs_path = self.outputs_path(job.id);
        let _guard = self
            .write_context_file(job, user_data)
            .map_err(|e| DeployError::Apply(e.to_string()))?;

        let spec = self
            .base_spec(creds, &stack, self.tool.apply_timeout())
            .arg("deploy")
            .arg(&stack)
            .args(["--require-approval", "never"])
            .arg("--outputs-file")
            .arg(outputs_path.to_string_lossy().to_string())
            .args(context_args(job, user_data, &stack));

        let mut spec = spec;
        spec.silence_notice = Some(self.tool.silence_notice());

        self.run_logged(spec, logger)
            .await
            .map_err(|e| DeployError::Apply(e.to_string()))?;

        let outputs = match read_outputs(&outputs_path, &stack) {
            Ok(outputs) => outputs,
            Err(e) => {
                logger
                    .warning(
                        SOURCE_DEPLOY,
                        &format!("Deployment succeeded but outputs were not readable: {e}"),
                    )
                    .await;
                JobOutputs::default()
            }
        };
        let _ = std::fs::remove_file(&outputs_path);
        Ok(outputs)
    }

    /// Tear the stack down. Safe to call for a stack that was never applied;
    /// the tool reports that as success.
    pub async fn destroy(
        &self,
        job: &Job,
        creds: &ResolvedCredentials,
        logger: &JobLogger,
    ) -> Result<(), DeployError> {
        let stack = stack_name(job.id);

        let spec = self
            .base_spec(creds, &stack, self.tool.destroy_timeout())
            .arg("destroy")
            .arg(&stack)
            .arg("--force")
            .args(context_args(job, "", &stack));

        self.run_logged(spec, logger)
            .await
            .map_err(|e| DeployError::Destroy(e.to_string()))?;
        Ok(())
    }

    fn base_spec(
        &self,
        creds: &ResolvedCredentials,
        stack: &str,
        timeout: std::time::Duration,
    ) -> CommandSpec {
        let mut env = creds.env_overlay();
        env.insert("SKIFF_STACK_NAME".to_string(), stack.to_string());

        CommandSpec::new(&self.tool.program, timeout)
            .args(self.tool.base_args.iter().cloned())
            .cwd(&self.tool.app_dir)
            .envs(&env)
    }

    async fn run_logged(
        &self,
        spec: CommandSpec,
        logger: &JobLogger,
    ) -> Result<(), CommandError> {
        let (tx, forwarder) = spawn_log_forwarder(logger.clone());
        let result = command::run(&spec, |line| {
            let _ = tx.send(line.to_string());
        })
        .await;
        drop(tx);
        let _ = forwarder.await;

        result?.require_success(&spec.program)?;
        Ok(())
    }

    fn outputs_path(&self, job_id: Uuid) -> PathBuf {
        self.tool.app_dir.join(format!("outputs-{job_id}.json"))
    }

    fn write_context_file(&self, job: &Job, user_data: &str) -> anyhow::Result<ContextFileGuard> {
        let path = self
            .tool
            .app_dir
            .join(format!("stack.context.{}.json", job.id));

        let context = serde_json::json!({
            "stackName": stack_name(job.id),
            "jobId": job.id,
            "jobName": job.name,
            "region": job.region,
            "tags": job.tags,
            "userDataBase64": BASE64.encode(user_data),
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&context)?)?;
        debug!("Wrote stack context for job {} to {path:?}", job.id);

        Ok(ContextFileGuard { path })
    }
}

/// Per-job parameters handed to the stack app as `--context key=value` pairs.
fn context_args(job: &Job, user_data: &str, stack: &str) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = vec![
        ("stackName".into(), stack.to_string()),
        ("jobId".into(), job.id.to_string()),
        ("instanceType".into(), job.instance_type.clone()),
        ("volumeSizeGb".into(), job.volume_size_gb.to_string()),
        ("region".into(), job.region.clone()),
    ];

    if let Some(vpc_id) = &job.vpc_id {
        pairs.push(("vpcId".into(), vpc_id.clone()));
    }
    if let Some(subnet_id) = &job.subnet_id {
        pairs.push(("subnetId".into(), subnet_id.clone()));
    }
    if !job.security_group_ids.is_empty() {
        pairs.push(("securityGroupIds".into(), job.security_group_ids.join(",")));
    }
    if let Some(image_id) = job.cached_image_used.as_ref().or(job.image_id.as_ref()) {
        pairs.push(("imageId".into(), image_id.clone()));
    }
    if let Some(key_pair) = &job.key_pair_name {
        pairs.push(("keyPairName".into(), key_pair.clone()));
    }
    if !user_data.is_empty() {
        pairs.push(("userDataBase64".into(), BASE64.encode(user_data)));
    }

    pairs
        .into_iter()
        .flat_map(|(k, v)| ["--context".to_string(), format!("{k}={v}")])
        .collect()
}

/// Parse the tool's outputs file: a map keyed by stack name, each entry a map
/// of output names to values.
fn read_outputs(path: &Path, stack: &str) -> anyhow::Result<JobOutputs> {
    let content = std::fs::read_to_string(path)?;
    let parsed: HashMap<String, HashMap<String, Value>> = serde_json::from_str(&content)?;

    let stack_outputs = parsed
        .get(stack)
        .ok_or_else(|| anyhow::anyhow!("outputs file has no entry for stack {stack}"))?;

    let mut outputs = JobOutputs::default();
    for (key, value) in stack_outputs {
        let as_string = value.as_str().map(str::to_string);
        match key.as_str() {
            "InstanceId" => outputs.instance_id = as_string,
            "PublicIP" => outputs.public_ip = as_string,
            "PrivateIP" => outputs.private_ip = as_string,
            _ => {
                outputs.extra.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(outputs)
}

fn spawn_log_forwarder(
    logger: JobLogger,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            logger.info(SOURCE_DEPLOY, &line).await;
        }
    });
    (tx, handle)
}
