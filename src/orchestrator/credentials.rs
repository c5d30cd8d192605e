use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::orchestrator::config::CloudSettings;
use crate::orchestrator::job::AuthMethod;
use crate::orchestrator::provider::CloudProvider;

const DEFAULT_SESSION_NAME: &str = "skiff-provisioner";

/// Short-lived credentials scoped to one job execution. Held in memory for
/// the duration of the run and handed to children as an environment overlay;
/// never written to disk or to the job record.
#[derive(Clone)]
pub struct ResolvedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub region: String,
}

impl ResolvedCredentials {
    /// Environment overlay for a child process acting under this identity.
    pub fn env_overlay(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone());
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            self.secret_access_key.clone(),
        );
        if let Some(token) = &self.session_token {
            env.insert("AWS_SESSION_TOKEN".to_string(), token.clone());
        }
        env.insert("AWS_DEFAULT_REGION".to_string(), self.region.clone());
        env
    }
}

// Manual Debug so secrets never leak through error chains or debug logs.
impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .field("region", &self.region)
            .finish()
    }
}

/// Identity the resolved credentials act as.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
    pub user_id: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential configuration incomplete: {0}")]
    MissingConfiguration(String),
    #[error("role assumption denied for {role_arn}: {reason}")]
    AssumeDenied { role_arn: String, reason: String },
    #[error("static keys rejected by the provider: {0}")]
    InvalidKeys(String),
}

/// Resolves a job's configured auth method into usable per-execution
/// credentials, validated against the provider before any deployment work
/// starts.
pub struct CredentialResolver {
    provider: Arc<dyn CloudProvider>,
    settings: CloudSettings,
}

impl CredentialResolver {
    pub fn new(provider: Arc<dyn CloudProvider>, settings: CloudSettings) -> Self {
        Self { provider, settings }
    }

    /// Resolve and validate. Configuration gaps are reported without any
    /// provider round-trip; provider calls only happen for a complete config.
    pub async fn resolve(
        &self,
        auth: &AuthMethod,
        region: &str,
    ) -> Result<(ResolvedCredentials, CallerIdentity), CredentialError> {
        match auth {
            AuthMethod::AssumeRole {
                role_arn,
                external_id,
                session_name,
            } => {
                let role_arn = match role_arn.as_deref() {
                    Some(arn) if !arn.is_empty() => arn,
                    _ => {
                        return Err(CredentialError::MissingConfiguration(
                            "assume-role auth requires a role ARN".to_string(),
                        ))
                    }
                };
                let session_name = session_name
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_SESSION_NAME);

                let base = self.base_credentials(region)?;
                let creds = self
                    .provider
                    .assume_role(
                        &base,
                        role_arn,
                        session_name,
                        external_id.as_deref(),
                        region,
                    )
                    .await
                    .map_err(|e| CredentialError::AssumeDenied {
                        role_arn: role_arn.to_string(),
                        reason: e.to_string(),
                    })?;

                let identity = self
                    .provider
                    .caller_identity(&creds)
                    .await
                    .map_err(|e| CredentialError::AssumeDenied {
                        role_arn: role_arn.to_string(),
                        reason: format!("assumed identity check failed: {e}"),
                    })?;

                Ok((creds, identity))
            }
            AuthMethod::StaticKeys {
                access_key_id,
                secret_access_key,
            } => {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(CredentialError::MissingConfiguration(
                        "static-key auth requires both an access key id and a secret".to_string(),
                    ));
                }

                let creds = ResolvedCredentials {
                    access_key_id: access_key_id.clone(),
                    secret_access_key: secret_access_key.clone(),
                    session_token: None,
                    expiration: None,
                    region: region.to_string(),
                };

                // Validate before anything downstream spends time on them
                let identity = self
                    .provider
                    .caller_identity(&creds)
                    .await
                    .map_err(|e| CredentialError::InvalidKeys(e.to_string()))?;

                Ok((creds, identity))
            }
        }
    }

    /// Base identity used as the source for role assumption, from the
    /// orchestrator's own configuration.
    fn base_credentials(&self, region: &str) -> Result<ResolvedCredentials, CredentialError> {
        match (
            &self.settings.base_access_key_id,
            &self.settings.base_secret_access_key,
        ) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Ok(ResolvedCredentials {
                    access_key_id: key.clone(),
                    secret_access_key: secret.clone(),
                    session_token: None,
                    expiration: None,
                    region: region.to_string(),
                })
            }
            _ => Err(CredentialError::MissingConfiguration(
                "assume-role auth requires base credentials in the orchestrator config"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::provider::{
        CloudProvider, ImageDescription, RemoteCommandOutput,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProvider {
        assume_calls: AtomicU32,
        identity_calls: AtomicU32,
        reject_identity: bool,
    }

    #[async_trait]
    impl CloudProvider for RecordingProvider {
        async fn assume_role(
            &self,
            _base: &ResolvedCredentials,
            role_arn: &str,
            session_name: &str,
            _external_id: Option<&str>,
            region: &str,
        ) -> Result<ResolvedCredentials> {
            self.assume_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(session_name, "skiff-provisioner");
            assert!(role_arn.starts_with("arn:"));
            Ok(ResolvedCredentials {
                access_key_id: "ASIATEMP".to_string(),
                secret_access_key: "temp-secret".to_string(),
                session_token: Some("token".to_string()),
                expiration: Some(Utc::now() + chrono::Duration::hours(1)),
                region: region.to_string(),
            })
        }

        async fn caller_identity(&self, _creds: &ResolvedCredentials) -> Result<CallerIdentity> {
            self.identity_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_identity {
                anyhow::bail!("InvalidClientTokenId");
            }
            Ok(CallerIdentity {
                account_id: "123456789012".to_string(),
                arn: "arn:aws:iam::123456789012:user/tester".to_string(),
                user_id: "AIDATEST".to_string(),
            })
        }

        async fn find_images(
            &self,
            _creds: &ResolvedCredentials,
            _tag_filters: &HashMap<String, String>,
        ) -> Result<Vec<ImageDescription>> {
            Ok(Vec::new())
        }

        async fn create_image(
            &self,
            _creds: &ResolvedCredentials,
            _instance_id: &str,
            _name: &str,
            _tags: &HashMap<String, String>,
        ) -> Result<String> {
            anyhow::bail!("not used")
        }

        async fn image_state(
            &self,
            _creds: &ResolvedCredentials,
            _image_id: &str,
        ) -> Result<String> {
            anyhow::bail!("not used")
        }

        async fn vpc_exists(&self, _creds: &ResolvedCredentials, _vpc_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn run_remote_command(
            &self,
            _creds: &ResolvedCredentials,
            _instance_id: &str,
            _commands: &[String],
            _timeout: Duration,
        ) -> Result<RemoteCommandOutput> {
            anyhow::bail!("not used")
        }
    }

    fn resolver(provider: RecordingProvider, with_base: bool) -> CredentialResolver {
        let settings = CloudSettings {
            base_access_key_id: with_base.then(|| "AKIABASE".to_string()),
            base_secret_access_key: with_base.then(|| "base-secret".to_string()),
            ..CloudSettings::default()
        };
        CredentialResolver::new(Arc::new(provider), settings)
    }

    #[tokio::test]
    async fn test_missing_role_arn_fails_without_provider_call() {
        let provider = RecordingProvider::default();
        let assume_calls = Arc::new(provider);
        let resolver = CredentialResolver::new(assume_calls.clone(), CloudSettings::default());

        let auth = AuthMethod::AssumeRole {
            role_arn: None,
            external_id: None,
            session_name: None,
        };
        let err = resolver.resolve(&auth, "us-west-2").await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingConfiguration(_)));
        assert_eq!(assume_calls.assume_calls.load(Ordering::SeqCst), 0);
        assert_eq!(assume_calls.identity_calls.load(Ordering::SeqCst), 0);

        // Empty string is treated the same as absent
        let auth = AuthMethod::AssumeRole {
            role_arn: Some(String::new()),
            external_id: None,
            session_name: None,
        };
        let err = resolver.resolve(&auth, "us-west-2").await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingConfiguration(_)));
        assert_eq!(assume_calls.assume_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_assume_role_with_default_session_name() {
        let resolver = resolver(RecordingProvider::default(), true);

        let auth = AuthMethod::AssumeRole {
            role_arn: Some("arn:aws:iam::123456789012:role/Provisioner".to_string()),
            external_id: None,
            session_name: None,
        };
        let (creds, identity) = resolver.resolve(&auth, "eu-west-1").await.unwrap();
        assert_eq!(creds.region, "eu-west-1");
        assert!(creds.session_token.is_some());
        assert_eq!(identity.account_id, "123456789012");
    }

    #[tokio::test]
    async fn test_assume_role_without_base_credentials() {
        let resolver = resolver(RecordingProvider::default(), false);

        let auth = AuthMethod::AssumeRole {
            role_arn: Some("arn:aws:iam::123456789012:role/Provisioner".to_string()),
            external_id: None,
            session_name: None,
        };
        let err = resolver.resolve(&auth, "us-west-2").await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingConfiguration(_)));
    }

    #[tokio::test]
    async fn test_static_keys_validated() {
        let resolver = resolver(RecordingProvider::default(), false);

        let auth = AuthMethod::StaticKeys {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
        };
        let (creds, identity) = resolver.resolve(&auth, "us-west-2").await.unwrap();
        assert!(creds.session_token.is_none());
        assert_eq!(identity.account_id, "123456789012");
    }

    #[tokio::test]
    async fn test_static_keys_rejected() {
        let provider = RecordingProvider {
            reject_identity: true,
            ..RecordingProvider::default()
        };
        let resolver = resolver(provider, false);

        let auth = AuthMethod::StaticKeys {
            access_key_id: "AKIABAD".to_string(),
            secret_access_key: "bad".to_string(),
        };
        let err = resolver.resolve(&auth, "us-west-2").await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeys(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = ResolvedCredentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "super-secret".to_string(),
            session_token: Some("session-secret".to_string()),
            expiration: None,
            region: "us-west-2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("session-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_env_overlay() {
        let creds = ResolvedCredentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
            expiration: None,
            region: "ap-southeast-2".to_string(),
        };
        let env = creds.env_overlay();
        assert_eq!(env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKIATEST"));
        assert_eq!(
            env.get("AWS_DEFAULT_REGION").map(String::as_str),
            Some("ap-southeast-2")
        );
        assert!(!env.contains_key("AWS_SESSION_TOKEN"));
    }
}
