pub mod orchestrator;

// Log source tags, kept in one place so log queries stay consistent
pub const SOURCE_ORCHESTRATOR: &str = "orchestrator";
pub const SOURCE_CREDENTIALS: &str = "credentials";
pub const SOURCE_DEPLOY: &str = "deploy";
pub const SOURCE_IMAGE_CACHE: &str = "image-cache";
pub const SOURCE_READINESS: &str = "readiness";
pub const SOURCE_INSTANCE: &str = "instance";

// Tag keys stamped onto provider resources created by this system
pub const TAG_MANAGED_BY: &str = "ManagedBy";
pub const TAG_MANAGED_BY_VALUE: &str = "skiff";
pub const TAG_SOFTWARE_VERSION: &str = "skiff:software-version";
pub const TAG_SOURCE_JOB: &str = "skiff:source-job";
pub const TAG_CREATED_AT: &str = "skiff:created-at";
