use anyhow::Result;

use crate::config::{Config, PipelineSettings};
use crate::ui;

pub async fn execute(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => get_config_value(key),
        ConfigAction::Set { key, value } => set_config_value(key, value),
        ConfigAction::List => list_config(),
    }
}

#[derive(Debug)]
pub enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

fn get_config_value(key: String) -> Result<()> {
    let config = Config::load()?;

    match key.as_str() {
        "api_url" | "api-url" => ui::info(&config.api_url),
        "token" => ui::info(&config.token),
        "default_gallery" | "default-gallery" => {
            ui::info(config.default_gallery.as_deref().unwrap_or("(not set)"))
        }
        "pipeline" => ui::info(&serde_json::to_string_pretty(&config.pipeline_settings())?),
        _ => anyhow::bail!(
            "Unknown config key: {}. Valid keys: api_url, token, default_gallery, pipeline",
            key
        ),
    }

    Ok(())
}

fn set_config_value(key: String, value: String) -> Result<()> {
    if std::env::var("PHOTODROP_API_TOKEN").is_ok()
        && matches!(key.as_str(), "default_gallery" | "default-gallery")
    {
        ui::info("Warning: You are using environment variables for authentication.");
        ui::info(&format!(
            "   To set default_gallery, use: export PHOTODROP_DEFAULT_GALLERY=\"{value}\""
        ));
        ui::info("   Or remove PHOTODROP_API_TOKEN to use config file mode.");
        return Ok(());
    }

    let mut config = Config::load()?;

    match key.as_str() {
        "api_url" | "api-url" => {
            config.update(|cfg| cfg.api_url = value.clone())?;
            ui::info(&format!("Set api_url to: {value}"));
        }
        "default_gallery" | "default-gallery" => {
            if value.is_empty() {
                config.update(|cfg| cfg.default_gallery = None)?;
                ui::info("Cleared default_gallery");
            } else {
                let gallery = crate::api::validate_resource_id("gallery", &value)?;
                config.update(|cfg| cfg.default_gallery = Some(gallery.clone()))?;
                ui::info(&format!("Set default_gallery to: {gallery}"));
            }
        }
        "pipeline" => {
            let settings: PipelineSettings = serde_json::from_str(&value)
                .map_err(|e| anyhow::anyhow!("Invalid pipeline settings JSON: {e}"))?;
            config.update(|cfg| cfg.pipeline = Some(settings))?;
            ui::info("Updated pipeline settings");
        }
        "token" => {
            anyhow::bail!("Token cannot be set via config command. Use 'photodrop auth --token <token>' instead.");
        }
        _ => anyhow::bail!(
            "Unknown config key: {}. Valid keys: api_url, default_gallery, pipeline",
            key
        ),
    }

    Ok(())
}

fn list_config() -> Result<()> {
    let config = Config::load()?;
    let settings = config.pipeline_settings();

    ui::info("Photodrop Configuration:");
    ui::info(&format!("  api_url: {}", config.api_url));
    ui::info(&format!("  token: {}", mask_token(&config.token)));
    ui::info(&format!(
        "  default_gallery: {}",
        config.default_gallery.as_deref().unwrap_or("(not set)")
    ));
    ui::info(&format!(
        "  pipeline: batch {} ms / {} files, {} file and {} part transfers, poll {} x {} ms",
        settings.batch_window_ms,
        settings.max_batch_size,
        settings.file_concurrency,
        settings.part_concurrency,
        settings.poll_max_attempts,
        settings.poll_interval_ms
    ));

    Ok(())
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "*****");
        assert_eq!(mask_token("pd_live_0123456789abcd"), "pd_live_...abcd");
    }
}
