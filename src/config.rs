//! TOML configuration and startup secrets.
//!
//! The configuration file is read once at startup. Secrets (API keys,
//! credential paths, the webhook URL) come from the environment and are
//! resolved by [`Secrets`] for whichever components are enabled.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Stage names accepted in `pipeline.stages`, in their canonical order.
pub const KNOWN_STAGES: &[&str] = &["staging", "ocr", "cleanup", "bundle"];

/// Source store backends accepted in `pipeline.source_store`.
pub const KNOWN_SOURCE_STORES: &[&str] = &["google_drive", "local"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub bundles: Vec<StorageBundle>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub source_store: String,
    #[serde(default = "default_dest_store")]
    pub dest_store: String,
    pub temp_storage_folder: PathBuf,
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default)]
    pub stage_concurrency: usize,
}

fn default_dest_store() -> String {
    "local".to_string()
}
fn default_stages() -> Vec<String> {
    KNOWN_STAGES.iter().map(|s| s.to_string()).collect()
}
fn default_failure_threshold() -> usize {
    3
}
fn default_failure_window_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_url")]
    pub api_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            api_url: default_ocr_url(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_url() -> String {
    "https://api.mathpix.com/v3/pdf".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_ocr_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_cleanup_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            api_url: default_cleanup_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_cleanup_timeout_secs(),
        }
    }
}

fn default_cleanup_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_cleanup_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    #[serde(default = "default_drive_url")]
    pub api_url: String,
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_channel_ttl_secs")]
    pub channel_ttl_secs: u64,
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: u64,
    #[serde(default = "default_discovery_buffer")]
    pub discovery_buffer: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_url: default_drive_url(),
            renewal_interval_secs: default_renewal_interval_secs(),
            channel_ttl_secs: default_channel_ttl_secs(),
            expiry_margin_secs: default_expiry_margin_secs(),
            discovery_buffer: default_discovery_buffer(),
        }
    }
}

fn default_drive_url() -> String {
    "https://www.googleapis.com".to_string()
}
fn default_renewal_interval_secs() -> u64 {
    30 * 60
}
fn default_channel_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_expiry_margin_secs() -> u64 {
    60
}
fn default_discovery_buffer() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalConfig {
    #[serde(default = "default_local_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_local_poll_secs(),
        }
    }
}

fn default_local_poll_secs() -> u64 {
    10
}

/// Maps one watched source folder to where its output lands.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StorageBundle {
    pub source_folder: String,
    pub archive_folder: String,
    pub dest_attachments_folder: PathBuf,
    pub dest_notes_folder: PathBuf,
}

impl Config {
    /// Looks up the bundle whose `source_folder` matches `folder_id`.
    pub fn bundle_for(&self, folder_id: &str) -> Option<&StorageBundle> {
        find_bundle(&self.bundles, folder_id)
    }

    /// Staging folder, honouring the `LOCAL_STORAGE_PATH` override.
    pub fn staging_folder(&self) -> PathBuf {
        match std::env::var("LOCAL_STORAGE_PATH") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.pipeline.temp_storage_folder.clone(),
        }
    }

    pub fn stage_enabled(&self, name: &str) -> bool {
        self.pipeline.stages.iter().any(|s| s == name)
    }
}

pub fn find_bundle<'a>(bundles: &'a [StorageBundle], folder_id: &str) -> Option<&'a StorageBundle> {
    bundles.iter().find(|b| b.source_folder == folder_id)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.bundles.is_empty() {
        bail!("at least one [[bundles]] entry is required");
    }

    let mut seen = HashSet::new();
    for bundle in &config.bundles {
        if !seen.insert(bundle.source_folder.as_str()) {
            bail!(
                "bundles.source_folder '{}' is listed more than once",
                bundle.source_folder
            );
        }
    }

    if !KNOWN_SOURCE_STORES.contains(&config.pipeline.source_store.as_str()) {
        bail!(
            "Unknown source store: '{}'. Must be one of: {}",
            config.pipeline.source_store,
            KNOWN_SOURCE_STORES.join(", ")
        );
    }

    if config.pipeline.dest_store != "local" {
        bail!(
            "Unknown destination store: '{}'. Only 'local' is supported",
            config.pipeline.dest_store
        );
    }

    let mut stages = HashSet::new();
    for stage in &config.pipeline.stages {
        if !KNOWN_STAGES.contains(&stage.as_str()) {
            bail!(
                "Unknown stage: '{}'. Must be one of: {}",
                stage,
                KNOWN_STAGES.join(", ")
            );
        }
        if !stages.insert(stage.as_str()) {
            bail!("stage '{}' is listed more than once", stage);
        }
    }

    if config.db.max_connections == 0 {
        bail!("db.max_connections must be >= 1");
    }

    if config.pipeline.failure_threshold == 0 {
        bail!("pipeline.failure_threshold must be >= 1");
    }

    if config.ocr.poll_interval_secs == 0 {
        bail!("ocr.poll_interval_secs must be > 0");
    }
    if config.ocr.timeout_secs < config.ocr.poll_interval_secs {
        bail!("ocr.timeout_secs must be >= ocr.poll_interval_secs");
    }

    if config.drive.expiry_margin_secs >= config.drive.channel_ttl_secs {
        bail!("drive.expiry_margin_secs must be < drive.channel_ttl_secs");
    }
    if config.drive.renewal_interval_secs == 0 {
        bail!("drive.renewal_interval_secs must be > 0");
    }
    if config.local.poll_interval_secs == 0 {
        bail!("local.poll_interval_secs must be > 0");
    }
    if config.drive.discovery_buffer == 0 {
        bail!("drive.discovery_buffer must be > 0");
    }

    Ok(())
}

/// Secrets and paths supplied through the environment.
///
/// Only the variables needed by the configured source store and stages are
/// required; a missing one fails startup with the variable's name.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub google_service_key_file: Option<PathBuf>,
    pub google_webhook_url: Option<String>,
    pub webhook_channel_secret: Option<String>,
    pub mathpix_app_id: Option<String>,
    pub mathpix_app_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env(config: &Config) -> Result<Self> {
        let mut secrets = Secrets {
            webhook_channel_secret: optional_env("WEBHOOK_CHANNEL_SECRET"),
            ..Default::default()
        };

        if config.pipeline.source_store == "google_drive" {
            secrets.google_service_key_file =
                Some(PathBuf::from(required_env("GOOGLE_SERVICE_KEY_FILE")?));
            secrets.google_webhook_url = Some(required_env("GOOGLE_WEBHOOK_URL")?);
        }

        if config.stage_enabled("ocr") {
            secrets.mathpix_app_id = Some(required_env("MATHPIX_APP_ID")?);
            secrets.mathpix_app_key = Some(required_env("MATHPIX_APP_KEY")?);
        }

        if config.stage_enabled("cleanup") {
            secrets.openai_api_key = Some(required_env("OPENAI_API_KEY")?);
        }

        Ok(secrets)
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("{} environment variable not set", name),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[db]
path = "/tmp/scriptoria.sqlite"

[server]
bind = "127.0.0.1:0"

[pipeline]
source_store = "local"
temp_storage_folder = "/tmp/staging"

[[bundles]]
source_folder = "inbox"
archive_folder = "archive"
dest_attachments_folder = "/vault/attachments"
dest_notes_folder = "/vault/notes"
"#
        .to_string()
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(&base_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.pipeline.stages, vec!["staging", "ocr", "cleanup", "bundle"]);
        assert_eq!(config.pipeline.dest_store, "local");
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.drive.renewal_interval_secs, 1800);
        assert_eq!(config.drive.channel_ttl_secs, 86400);
        assert_eq!(config.drive.expiry_margin_secs, 60);
        assert_eq!(config.ocr.poll_interval_secs, 5);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let text = base_toml().replace(
            "temp_storage_folder = \"/tmp/staging\"",
            "temp_storage_folder = \"/tmp/staging\"\nstages = [\"ocr\", \"translate\"]",
        );
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("translate"));
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let mut config: Config = toml::from_str(&base_toml()).unwrap();
        let dup = config.bundles[0].clone();
        config.bundles.push(dup);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_source_store_rejected() {
        let text = base_toml().replace("source_store = \"local\"", "source_store = \"Dropbox\"");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_bundles_rejected() {
        let mut config: Config = toml::from_str(&base_toml()).unwrap();
        config.bundles.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bundle_lookup() {
        let config: Config = toml::from_str(&base_toml()).unwrap();
        assert!(config.bundle_for("inbox").is_some());
        assert!(config.bundle_for("elsewhere").is_none());
    }
}
