use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;

use crate::orchestrator::command::{self, CommandSpec};
use crate::orchestrator::config::CloudSettings;
use crate::orchestrator::credentials::{CallerIdentity, ResolvedCredentials};

/// A machine image as reported by the provider.
#[derive(Debug, Clone)]
pub struct ImageDescription {
    pub image_id: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RemoteCommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Provider API seam. Every call takes explicit credentials; implementations
/// hold no ambient identity of their own. The production implementation
/// shells out to the provider CLI, tests substitute an in-memory fake.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn assume_role(
        &self,
        base: &ResolvedCredentials,
        role_arn: &str,
        session_name: &str,
        external_id: Option<&str>,
        region: &str,
    ) -> Result<ResolvedCredentials>;

    async fn caller_identity(&self, creds: &ResolvedCredentials) -> Result<CallerIdentity>;

    /// Images matching all given tag filters, any state.
    async fn find_images(
        &self,
        creds: &ResolvedCredentials,
        tag_filters: &HashMap<String, String>,
    ) -> Result<Vec<ImageDescription>>;

    /// Start image creation from a running instance; returns the new image id
    /// without waiting for it to become available.
    async fn create_image(
        &self,
        creds: &ResolvedCredentials,
        instance_id: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    async fn image_state(&self, creds: &ResolvedCredentials, image_id: &str) -> Result<String>;

    async fn vpc_exists(&self, creds: &ResolvedCredentials, vpc_id: &str) -> Result<bool>;

    /// Run shell commands on a managed instance and collect their output.
    async fn run_remote_command(
        &self,
        creds: &ResolvedCredentials,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<RemoteCommandOutput>;
}

// Response shapes for the CLI's JSON output.

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    credentials: AssumeRoleCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityResponse {
    account: String,
    arn: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesResponse {
    images: Vec<ImageRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageRecord {
    image_id: String,
    state: String,
    creation_date: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImageResponse {
    image_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandResponse {
    command: SentCommand,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandInvocationResponse {
    status: String,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
    #[serde(default)]
    response_code: i32,
}

const INVOCATION_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// `CloudProvider` backed by the provider's CLI binary, run through the
/// command supervisor with the caller's credentials as an env overlay.
pub struct CliCloudProvider {
    settings: CloudSettings,
}

impl CliCloudProvider {
    pub fn new(settings: CloudSettings) -> Self {
        Self { settings }
    }

    async fn cli_json<T: for<'de> Deserialize<'de>>(
        &self,
        creds: &ResolvedCredentials,
        args: &[String],
    ) -> Result<T> {
        let spec = CommandSpec::new(&self.settings.cli_program, self.settings.api_timeout())
            .args(args.iter().cloned())
            .args(["--output", "json"])
            .envs(&creds.env_overlay());

        let output = command::run(&spec, |_| {})
            .await?
            .require_success(&self.settings.cli_program)?;

        serde_json::from_str(&output.text())
            .with_context(|| format!("unexpected CLI response for {args:?}"))
    }

    async fn cli_status(&self, creds: &ResolvedCredentials, args: &[String]) -> Result<i32> {
        let spec = CommandSpec::new(&self.settings.cli_program, self.settings.api_timeout())
            .args(args.iter().cloned())
            .envs(&creds.env_overlay());
        let output = command::run(&spec, |_| {}).await?;
        Ok(output.exit_code)
    }
}

#[async_trait]
impl CloudProvider for CliCloudProvider {
    async fn assume_role(
        &self,
        base: &ResolvedCredentials,
        role_arn: &str,
        session_name: &str,
        external_id: Option<&str>,
        region: &str,
    ) -> Result<ResolvedCredentials> {
        let mut args: Vec<String> = vec![
            "sts".into(),
            "assume-role".into(),
            "--role-arn".into(),
            role_arn.into(),
            "--role-session-name".into(),
            session_name.into(),
        ];
        if let Some(external_id) = external_id {
            args.push("--external-id".into());
            args.push(external_id.into());
        }

        let response: AssumeRoleResponse = self.cli_json(base, &args).await?;
        debug!(
            "Assumed role {role_arn}, credentials expire at {}",
            response.credentials.expiration
        );

        Ok(ResolvedCredentials {
            access_key_id: response.credentials.access_key_id,
            secret_access_key: response.credentials.secret_access_key,
            session_token: Some(response.credentials.session_token),
            expiration: Some(response.credentials.expiration),
            region: region.to_string(),
        })
    }

    async fn caller_identity(&self, creds: &ResolvedCredentials) -> Result<CallerIdentity> {
        let args: Vec<String> = vec!["sts".into(), "get-caller-identity".into()];
        let response: CallerIdentityResponse = self.cli_json(creds, &args).await?;
        Ok(CallerIdentity {
            account_id: response.account,
            arn: response.arn,
            user_id: response.user_id,
        })
    }

    async fn find_images(
        &self,
        creds: &ResolvedCredentials,
        tag_filters: &HashMap<String, String>,
    ) -> Result<Vec<ImageDescription>> {
        let mut args: Vec<String> = vec![
            "ec2".into(),
            "describe-images".into(),
            "--owners".into(),
            "self".into(),
        ];
        // One --filters flag taking every filter token; the CLI keeps only
        // the last occurrence of a repeated option. Sorted for stable
        // invocations.
        if !tag_filters.is_empty() {
            args.push("--filters".into());
            let mut filters: Vec<_> = tag_filters.iter().collect();
            filters.sort_by_key(|(key, _)| key.as_str());
            for (key, value) in filters {
                args.push(format!("Name=tag:{key},Values={value}"));
            }
        }

        let response: DescribeImagesResponse = self.cli_json(creds, &args).await?;
        Ok(response
            .images
            .into_iter()
            .map(|img| ImageDescription {
                image_id: img.image_id,
                state: img.state,
                created_at: img.creation_date,
            })
            .collect())
    }

    async fn create_image(
        &self,
        creds: &ResolvedCredentials,
        instance_id: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        let tag_spec = tags
            .iter()
            .map(|(k, v)| format!("{{Key={k},Value={v}}}"))
            .collect::<Vec<_>>()
            .join(",");

        let args: Vec<String> = vec![
            "ec2".into(),
            "create-image".into(),
            "--instance-id".into(),
            instance_id.into(),
            "--name".into(),
            name.into(),
            // Reboot before snapshotting so the image's filesystem is
            // consistent
            "--reboot".into(),
            "--tag-specifications".into(),
            format!("ResourceType=image,Tags=[{tag_spec}]"),
        ];

        let response: CreateImageResponse = self.cli_json(creds, &args).await?;
        Ok(response.image_id)
    }

    async fn image_state(&self, creds: &ResolvedCredentials, image_id: &str) -> Result<String> {
        let args: Vec<String> = vec![
            "ec2".into(),
            "describe-images".into(),
            "--image-ids".into(),
            image_id.into(),
        ];
        let response: DescribeImagesResponse = self.cli_json(creds, &args).await?;
        response
            .images
            .into_iter()
            .next()
            .map(|img| img.state)
            .ok_or_else(|| anyhow!("image {image_id} not found"))
    }

    async fn vpc_exists(&self, creds: &ResolvedCredentials, vpc_id: &str) -> Result<bool> {
        let args: Vec<String> = vec![
            "ec2".into(),
            "describe-vpcs".into(),
            "--vpc-ids".into(),
            vpc_id.into(),
            "--output".into(),
            "json".into(),
        ];

        // A missing vpc makes the CLI exit non-zero; that is an answer, not
        // an error.
        match self.cli_status(creds, &args).await? {
            0 => Ok(true),
            _ => Ok(false),
        }
    }

    async fn run_remote_command(
        &self,
        creds: &ResolvedCredentials,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<RemoteCommandOutput> {
        let parameters = serde_json::json!({ "commands": commands }).to_string();
        let send_args: Vec<String> = vec![
            "ssm".into(),
            "send-command".into(),
            "--instance-ids".into(),
            instance_id.into(),
            "--document-name".into(),
            "AWS-RunShellScript".into(),
            "--parameters".into(),
            parameters,
        ];

        let sent: SendCommandResponse = self.cli_json(creds, &send_args).await?;
        let command_id = sent.command.command_id;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(INVOCATION_POLL_INTERVAL).await;

            let poll_args: Vec<String> = vec![
                "ssm".into(),
                "get-command-invocation".into(),
                "--command-id".into(),
                command_id.clone(),
                "--instance-id".into(),
                instance_id.into(),
            ];
            let invocation: CommandInvocationResponse =
                self.cli_json(creds, &poll_args).await?;

            match invocation.status.as_str() {
                "Pending" | "InProgress" | "Delayed" => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(anyhow!(
                            "remote command {command_id} on {instance_id} timed out after {timeout:?}"
                        ));
                    }
                }
                _ => {
                    return Ok(RemoteCommandOutput {
                        stdout: invocation.standard_output_content,
                        stderr: invocation.standard_error_content,
                        exit_code: invocation.response_code,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    /// Shell stub standing in for the provider CLI: records every argument
    /// (one per line) and answers with a canned JSON document.
    fn stub_cli(dir: &Path, response: &str) -> (PathBuf, PathBuf) {
        let args_file = dir.join("cli-args.log");
        let response_file = dir.join("cli-response.json");
        std::fs::write(&response_file, response).unwrap();

        let program = dir.join("stub-cli.sh");
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" >> {}\ncat {}\n",
            args_file.display(),
            response_file.display()
        );
        std::fs::write(&program, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (program, args_file)
    }

    fn stub_provider(program: &Path) -> CliCloudProvider {
        CliCloudProvider::new(crate::orchestrator::config::CloudSettings {
            cli_program: program.to_string_lossy().to_string(),
            ..crate::orchestrator::config::CloudSettings::default()
        })
    }

    fn test_creds() -> ResolvedCredentials {
        ResolvedCredentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
            expiration: None,
            region: "us-west-2".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_image_reboots_for_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let (program, args_file) = stub_cli(dir.path(), r#"{"ImageId": "ami-0new"}"#);
        let provider = stub_provider(&program);

        let image_id = provider
            .create_image(&test_creds(), "i-0abc", "skiff-1-2-3-x", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(image_id, "ami-0new");

        let args: Vec<String> = std::fs::read_to_string(&args_file)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert!(args.contains(&"--reboot".to_string()));
        assert!(!args.contains(&"--no-reboot".to_string()));
    }

    #[tokio::test]
    async fn test_find_images_uses_single_filters_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (program, args_file) = stub_cli(dir.path(), r#"{"Images": []}"#);
        let provider = stub_provider(&program);

        let mut filters = HashMap::new();
        filters.insert("ManagedBy".to_string(), "skiff".to_string());
        filters.insert("skiff:software-version".to_string(), "1-2-3".to_string());

        provider.find_images(&test_creds(), &filters).await.unwrap();

        let args: Vec<String> = std::fs::read_to_string(&args_file)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        // A repeated --filters would make the CLI drop all but the last one
        assert_eq!(args.iter().filter(|a| *a == "--filters").count(), 1);
        assert!(args.contains(&"Name=tag:ManagedBy,Values=skiff".to_string()));
        assert!(args.contains(&"Name=tag:skiff:software-version,Values=1-2-3".to_string()));
    }

    #[test]
    fn test_assume_role_response_parsing() {
        let json = r#"{
            "Credentials": {
                "AccessKeyId": "ASIATEMP",
                "SecretAccessKey": "temp-secret",
                "SessionToken": "token",
                "Expiration": "2026-01-01T12:00:00Z"
            },
            "AssumedRoleUser": {
                "AssumedRoleId": "AROATEST:session",
                "Arn": "arn:aws:sts::123456789012:assumed-role/Provisioner/session"
            }
        }"#;
        let parsed: AssumeRoleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.credentials.access_key_id, "ASIATEMP");
        assert_eq!(parsed.credentials.session_token, "token");
    }

    #[test]
    fn test_caller_identity_response_parsing() {
        let json = r#"{
            "UserId": "AIDATEST",
            "Account": "123456789012",
            "Arn": "arn:aws:iam::123456789012:user/tester"
        }"#;
        let parsed: CallerIdentityResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.account, "123456789012");
        assert_eq!(parsed.user_id, "AIDATEST");
    }

    #[test]
    fn test_describe_images_response_parsing() {
        let json = r#"{
            "Images": [
                {
                    "ImageId": "ami-0abc",
                    "State": "available",
                    "CreationDate": "2026-02-03T04:05:06.000Z",
                    "Name": "skiff-1-2-3-20260203"
                },
                {
                    "ImageId": "ami-0def",
                    "State": "pending",
                    "CreationDate": "2026-02-04T00:00:00.000Z"
                }
            ]
        }"#;
        let parsed: DescribeImagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.images.len(), 2);
        assert_eq!(parsed.images[0].image_id, "ami-0abc");
        assert_eq!(parsed.images[1].state, "pending");
        assert!(parsed.images[1].creation_date > parsed.images[0].creation_date);
    }

    #[test]
    fn test_command_invocation_defaults() {
        // In-flight invocations omit the output fields
        let json = r#"{ "Status": "InProgress" }"#;
        let parsed: CommandInvocationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, "InProgress");
        assert_eq!(parsed.standard_output_content, "");
        assert_eq!(parsed.response_code, 0);
    }
}
