use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration.
///
/// Loaded from a TOML file with environment-variable overrides layered on
/// top, then validated. Components never read process environment
/// themselves; the settings struct is threaded as an explicit argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub region: String,
    pub tool: ToolSettings,
    pub cloud: CloudSettings,
    pub software: SoftwareSettings,
    pub image_cache: ImageCacheSettings,
    pub readiness: ReadinessSettings,
    pub log_bridge: LogBridgeSettings,
}

/// The supervised IaC tool subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub program: String,
    /// Arguments prepended before the verb (e.g. `["cdk"]` when the program
    /// is a launcher like npx).
    pub base_args: Vec<String>,
    pub app_dir: PathBuf,
    pub synth_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    /// Silent-stretch threshold before advisory progress lines are injected.
    pub silence_notice_secs: u64,
}

/// Provider API access: the CLI binary used for identity, image and
/// remote-command calls, plus the base identity for role assumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub cli_program: String,
    pub api_timeout_secs: u64,
    pub base_access_key_id: Option<String>,
    pub base_secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareSettings {
    /// Installer package fetched by the full bootstrap script.
    pub package_url: String,
    /// Base machine image used when no cached image applies. Empty means the
    /// deployment tool picks its platform default.
    pub default_image_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheSettings {
    pub poll_interval_secs: u64,
    pub create_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Marker string the probe requires in a 200 response body.
    pub marker: String,
    pub warmup_secs: u64,
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogBridgeSettings {
    pub interval_secs: u64,
    pub max_iterations: u32,
    pub remote_log_path: String,
    pub remote_command_timeout_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            tool: ToolSettings::default(),
            cloud: CloudSettings::default(),
            software: SoftwareSettings::default(),
            image_cache: ImageCacheSettings::default(),
            readiness: ReadinessSettings::default(),
            log_bridge: LogBridgeSettings::default(),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            base_args: vec!["cdk".to_string()],
            app_dir: PathBuf::from("./stack"),
            synth_timeout_secs: 120,
            apply_timeout_secs: 600,
            destroy_timeout_secs: 300,
            silence_notice_secs: 20,
        }
    }
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            cli_program: "aws".to_string(),
            api_timeout_secs: 60,
            base_access_key_id: None,
            base_secret_access_key: None,
        }
    }
}

impl Default for SoftwareSettings {
    fn default() -> Self {
        Self {
            package_url: String::new(),
            default_image_id: None,
        }
    }
}

impl Default for ImageCacheSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            create_timeout_secs: 2400,
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            marker: "login".to_string(),
            warmup_secs: 180,
            interval_secs: 60,
            // 90 attempts at a 60s interval bounds total polling to ~1.5h
            max_attempts: 90,
            probe_timeout_secs: 10,
        }
    }
}

impl Default for LogBridgeSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_iterations: 240,
            remote_log_path: "/var/log/skiff-deploy.log".to_string(),
            remote_command_timeout_secs: 60,
        }
    }
}

impl OrchestratorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(anyhow::anyhow!("region must not be empty"));
        }
        if self.tool.program.is_empty() {
            return Err(anyhow::anyhow!("tool.program must not be empty"));
        }
        if self.readiness.interval_secs == 0 {
            return Err(anyhow::anyhow!("readiness.interval_secs must be greater than 0"));
        }
        if self.readiness.max_attempts == 0 {
            return Err(anyhow::anyhow!("readiness.max_attempts must be greater than 0"));
        }
        if self.image_cache.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "image_cache.poll_interval_secs must be greater than 0"
            ));
        }
        if self.log_bridge.interval_secs == 0 {
            return Err(anyhow::anyhow!("log_bridge.interval_secs must be greater than 0"));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("SKIFF_REGION") {
            self.region = region;
        }
        if let Ok(program) = std::env::var("SKIFF_TOOL_PROGRAM") {
            self.tool.program = program;
        }
        if let Ok(dir) = std::env::var("SKIFF_TOOL_APP_DIR") {
            self.tool.app_dir = PathBuf::from(dir);
        }
        if let Ok(key) = std::env::var("SKIFF_BASE_ACCESS_KEY_ID") {
            self.cloud.base_access_key_id = Some(key);
        }
        if let Ok(secret) = std::env::var("SKIFF_BASE_SECRET_ACCESS_KEY") {
            self.cloud.base_secret_access_key = Some(secret);
        }
        if let Ok(url) = std::env::var("SKIFF_PACKAGE_URL") {
            self.software.package_url = url;
        }
        if let Ok(marker) = std::env::var("SKIFF_READINESS_MARKER") {
            self.readiness.marker = marker;
        }
        if let Ok(attempts) = std::env::var("SKIFF_READINESS_MAX_ATTEMPTS") {
            if let Ok(parsed) = attempts.parse() {
                self.readiness.max_attempts = parsed;
            }
        }
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(region) = &overrides.region {
            self.region = region.clone();
        }
        if let Some(app_dir) = &overrides.app_dir {
            self.tool.app_dir = app_dir.clone();
        }
    }
}

/// Command-line flags that win over both the config file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub region: Option<String>,
    pub app_dir: Option<PathBuf>,
}

impl ToolSettings {
    pub fn synth_timeout(&self) -> Duration {
        Duration::from_secs(self.synth_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    pub fn silence_notice(&self) -> Duration {
        Duration::from_secs(self.silence_notice_secs)
    }
}

impl CloudSettings {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl ImageCacheSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

impl ReadinessSettings {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl LogBridgeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn remote_command_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_command_timeout_secs)
    }
}

/// Load configuration: CLI flags > env vars > config file > defaults.
pub fn load_config(
    config_path: Option<&str>,
    overrides: &CliOverrides,
) -> Result<OrchestratorSettings> {
    let mut settings = OrchestratorSettings::default();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            let file_content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {path}"))?;

            settings = toml::from_str(&file_content)
                .with_context(|| format!("Failed to parse config file: {path}"))?;

            log::info!("Loaded configuration from file: {path}");
        } else {
            log::info!("Config file not found: {path}, using defaults");
        }
    }

    settings.apply_env_overrides();
    settings.apply_cli_overrides(overrides);
    settings
        .validate()
        .with_context(|| "Configuration validation failed")?;

    Ok(settings)
}

/// Write a sample configuration file with defaults.
pub fn create_sample_config(path: &str) -> Result<()> {
    let settings = OrchestratorSettings::default();
    let toml_content =
        toml::to_string_pretty(&settings).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    println!("Sample configuration written to: {path}");
    Ok(())
}
