use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::orchestrator::config::ImageCacheSettings;
use crate::orchestrator::credentials::ResolvedCredentials;
use crate::orchestrator::provider::CloudProvider;
use crate::{
    TAG_CREATED_AT, TAG_MANAGED_BY, TAG_MANAGED_BY_VALUE, TAG_SOFTWARE_VERSION, TAG_SOURCE_JOB,
};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image creation failed: {0}")]
    CreateFailed(String),
    #[error("image {image_id} did not become available within {waited_secs}s")]
    Timeout { image_id: String, waited_secs: u64 },
    #[error("provider call failed: {0}")]
    Provider(String),
}

/// How a cache-creation request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// A new image was created and became available.
    Created(String),
    /// Another job already produced an image for this version; its id is
    /// returned and nothing was created.
    Skipped(String),
}

/// Version tag values are normalized so that lookup and creation agree on
/// one canonical spelling regardless of how the version was entered.
pub fn normalize_version(version: &str) -> String {
    version
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Caches machine images per (region, software version).
///
/// The provider is the source of truth; the manager keeps no registry of its
/// own. Creations for the same version serialize on an in-process lock, and
/// each holder re-checks the provider before creating, so concurrent jobs
/// in one orchestrator produce exactly one image per version.
pub struct ImageCacheManager {
    provider: Arc<dyn CloudProvider>,
    settings: ImageCacheSettings,
    version_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ImageCacheManager {
    pub fn new(provider: Arc<dyn CloudProvider>, settings: ImageCacheSettings) -> Self {
        Self {
            provider,
            settings,
            version_locks: DashMap::new(),
        }
    }

    fn version_filters(version: &str) -> HashMap<String, String> {
        let mut filters = HashMap::new();
        filters.insert(TAG_MANAGED_BY.to_string(), TAG_MANAGED_BY_VALUE.to_string());
        filters.insert(
            TAG_SOFTWARE_VERSION.to_string(),
            normalize_version(version),
        );
        filters
    }

    /// Newest available cached image for this software version in the
    /// credential's region, if any.
    pub async fn find_cached(
        &self,
        creds: &ResolvedCredentials,
        version: &str,
    ) -> Result<Option<String>, ImageError> {
        let images = self
            .provider
            .find_images(creds, &Self::version_filters(version))
            .await
            .map_err(|e| ImageError::Provider(e.to_string()))?;

        let newest = images
            .into_iter()
            .filter(|img| img.state == "available")
            .max_by_key(|img| img.created_at);

        if let Some(img) = &newest {
            debug!(
                "Cached image for version {version}: {} (created {})",
                img.image_id, img.created_at
            );
        }
        Ok(newest.map(|img| img.image_id))
    }

    /// Create a cached image from a ready instance, unless one for this
    /// version appeared in the meantime. Waits until the new image is
    /// available, bounded by the configured creation timeout.
    pub async fn create_from_instance(
        &self,
        creds: &ResolvedCredentials,
        instance_id: &str,
        version: &str,
        source_job: &str,
    ) -> Result<ImageOutcome, ImageError> {
        let normalized = normalize_version(version);

        // Concurrent creations for one version take turns; each holder then
        // re-checks the provider, so the loser sees the winner's image
        let lock = self
            .version_locks
            .entry(normalized.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.find_cached(creds, version).await? {
            info!("Image for version {version} already exists ({existing}), skipping creation");
            return Ok(ImageOutcome::Skipped(existing));
        }

        let now = Utc::now();
        let name = format!("skiff-{normalized}-{}", now.format("%Y%m%d%H%M%S"));

        let mut tags = HashMap::new();
        tags.insert(TAG_MANAGED_BY.to_string(), TAG_MANAGED_BY_VALUE.to_string());
        tags.insert(TAG_SOFTWARE_VERSION.to_string(), normalized);
        tags.insert(TAG_SOURCE_JOB.to_string(), source_job.to_string());
        tags.insert(TAG_CREATED_AT.to_string(), now.to_rfc3339());

        let image_id = self
            .provider
            .create_image(creds, instance_id, &name, &tags)
            .await
            .map_err(|e| ImageError::CreateFailed(e.to_string()))?;
        info!("Creating image {image_id} ({name}) from instance {instance_id}");

        self.wait_available(creds, &image_id).await?;
        Ok(ImageOutcome::Created(image_id))
    }

    async fn wait_available(
        &self,
        creds: &ResolvedCredentials,
        image_id: &str,
    ) -> Result<(), ImageError> {
        let deadline = tokio::time::Instant::now() + self.settings.create_timeout();

        loop {
            let state = self
                .provider
                .image_state(creds, image_id)
                .await
                .map_err(|e| ImageError::Provider(e.to_string()))?;

            match state.as_str() {
                "available" => return Ok(()),
                "failed" | "error" => {
                    return Err(ImageError::CreateFailed(format!(
                        "image {image_id} entered state {state}"
                    )))
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ImageError::Timeout {
                    image_id: image_id.to_string(),
                    waited_secs: self.settings.create_timeout_secs,
                });
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}
