pub mod client;
pub mod models;

pub use client::ApiClient;
pub use models::*;

use anyhow::Result;

/// Checks a gallery or order identifier before it is placed in a URL path.
pub fn validate_resource_id(kind: &str, id: &str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("{} id cannot be empty", kind);
    }

    let is_valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !id.starts_with('-')
        && !id.ends_with('-');

    if !is_valid {
        anyhow::bail!(
            "Invalid {} id '{}'. Must contain only letters, digits, hyphens, and underscores, and cannot start or end with a hyphen.",
            kind,
            id
        );
    }

    Ok(id.to_string())
}
