use crate::api::validate_resource_id;
use crate::config::Config;
use crate::types::UploadTarget;
use anyhow::Result;

pub fn expand_tilde_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

pub fn get_gallery_id(gallery_option: Option<String>) -> Result<String> {
    if let Some(gallery) = gallery_option {
        return validate_resource_id("gallery", &gallery);
    }

    if let Some(gallery) = crate::config::env_var("PHOTODROP_DEFAULT_GALLERY") {
        return validate_resource_id("gallery", &gallery);
    }

    match Config::load() {
        Ok(config) => match config.default_gallery {
            Some(gallery) => validate_resource_id("gallery", &gallery),
            None => Err(anyhow::anyhow!("No gallery specified. Set PHOTODROP_DEFAULT_GALLERY or use 'photodrop config set default_gallery <id>'")),
        },
        Err(_) => Err(anyhow::anyhow!("No gallery specified and config not found. Set PHOTODROP_DEFAULT_GALLERY or run 'photodrop auth' first")),
    }
}

/// Gallery uploads without an order, delivery uploads with one.
pub fn build_target(gallery: &str, order: Option<String>) -> Result<UploadTarget> {
    let gallery = validate_resource_id("gallery", gallery)?;
    match order {
        Some(order) => Ok(UploadTarget::delivery(
            gallery,
            validate_resource_id("order", &order)?,
        )),
        None => Ok(UploadTarget::gallery(gallery)),
    }
}
