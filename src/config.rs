use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::types::MIB;

const CONFIG_DIR_NAME: &str = ".photodrop";
const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_API_URL: &str = "https://api.photodrop.app/v1";

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_api_token() -> Option<String> {
    if let Some(token) = env_var("PHOTODROP_API_TOKEN") {
        return Some(token);
    }

    let token_file = env_var("PHOTODROP_TOKEN_FILE")?;
    let token = fs::read_to_string(token_file).ok()?;
    let token = token.trim().to_string();

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Tunables of the upload pipeline. Read once when a session is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub batch_window_ms: u64,
    pub max_batch_size: usize,
    pub multipart_threshold: u64,
    pub batch_concurrency: usize,
    pub batch_requeue_limit: u32,
    pub file_concurrency: usize,
    pub part_concurrency: usize,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub retry: RetryPolicy,
    pub accepted_content_type: String,
    pub error_message_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_window_ms: 250,
            max_batch_size: 50,
            multipart_threshold: 100 * MIB,
            batch_concurrency: 2,
            batch_requeue_limit: 2,
            file_concurrency: 5,
            part_concurrency: 4,
            poll_interval_ms: 1000,
            poll_max_attempts: 60,
            retry: RetryPolicy::default(),
            accepted_content_type: "image/".to_string(),
            error_message_limit: 200,
        }
    }
}

impl PipelineSettings {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Clamps every limit to a usable minimum.
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = self.max_batch_size.max(1);
        self.batch_concurrency = self.batch_concurrency.max(1);
        self.file_concurrency = self.file_concurrency.max(1);
        self.part_concurrency = self.part_concurrency.max(1);
        self.poll_max_attempts = self.poll_max_attempts.max(1);
        self.multipart_threshold = self.multipart_threshold.max(1);
        self.error_message_limit = self.error_message_limit.max(16);
        self
    }

    /// Settings from the config file, or defaults when none is present.
    pub fn load() -> Self {
        Config::load_from_file()
            .ok()
            .and_then(|config| config.pipeline)
            .unwrap_or_default()
            .normalized()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_gallery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pipeline: Option<PipelineSettings>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Config {
    pub fn default_api_url_value() -> &'static str {
        DEFAULT_API_URL
    }

    pub fn load() -> Result<Self> {
        if let Some(env_token) = env_api_token() {
            let api_url =
                env_var("PHOTODROP_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
            let mut config = Config {
                api_url,
                token: env_token,
                default_gallery: env_var("PHOTODROP_DEFAULT_GALLERY"),
                pipeline: None,
            };
            if let Ok(file_config) = Self::load_from_file() {
                config.pipeline = file_config.pipeline;
            }
            return Ok(config);
        }

        Self::load_from_file()
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Err(ConfigError::ConfigNotFound.into());
        }

        let contents = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        if let Some(env_gallery) = env_var("PHOTODROP_DEFAULT_GALLERY") {
            config.default_gallery = Some(env_gallery);
        }

        Ok(config)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        self.pipeline.clone().unwrap_or_default().normalized()
    }

    pub fn save(token: String) -> Result<()> {
        let existing_config = Config::load_from_file().ok();
        let api_url = env_var("PHOTODROP_API_URL")
            .or_else(|| existing_config.as_ref().map(|c| c.api_url.clone()))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let default_gallery = existing_config
            .as_ref()
            .and_then(|cfg| cfg.default_gallery.clone())
            .or_else(|| env_var("PHOTODROP_DEFAULT_GALLERY"));

        let config = Config {
            api_url,
            token,
            default_gallery,
            pipeline: existing_config.and_then(|c| c.pipeline),
        };

        config.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let config_dir = config_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid config path"))?;

        fs::create_dir_all(config_dir).context("Failed to create config directory")?;

        let contents = serde_json::to_string_pretty(&self).context("Failed to serialize config")?;
        write_private_file(&config_path, contents.as_bytes())
    }

    pub fn update<F>(&mut self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut Self),
    {
        updater(self);
        self.save_config()
    }

    pub fn get_api_url(override_url: Option<String>) -> Result<String> {
        if let Some(url) = override_url {
            return Ok(url);
        }

        if let Some(url) = env_var("PHOTODROP_API_URL") {
            return Ok(url);
        }

        match Config::load() {
            Ok(config) => Ok(config.api_url),
            Err(_) => Ok(DEFAULT_API_URL.to_string()),
        }
    }

    pub fn home_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            return Ok(PathBuf::from(home));
        }
        dirs::home_dir().context(
            "Could not determine home directory. Please ensure HOME environment variable is set.",
        )
    }

    pub fn config_path() -> Result<PathBuf> {
        let home_dir = Self::home_dir()?;
        Ok(home_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn get_default_gallery(&self) -> Result<String, ConfigError> {
        self.default_gallery
            .clone()
            .ok_or(ConfigError::ConfigNotFound)
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context("Failed to open config file for writing")?;

        file.write_all(contents)
            .context("Failed to write config file")?;
    }

    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)
            .context("Failed to read config file metadata")?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)
            .context("Failed to set secure permissions on config file")?;
    }

    Ok(())
}
