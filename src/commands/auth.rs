use crate::api::ApiClient;
use crate::config::Config;
use crate::quota::StorageQuota;
use crate::ui;
use anyhow::Result;

pub async fn execute(token: String) -> Result<()> {
    ui::info("Validating token with server...");

    let api_client = ApiClient::new_with_token_override(Some(token.clone()))?;
    let session_info = api_client.validate_token(&token).await?;

    Config::save(token)?;

    ui::info("Token validated successfully!");

    match &session_info.user.email {
        Some(email) => ui::info(&format!("Signed in as {} <{}>", session_info.user.name, email)),
        None => ui::info(&format!("Signed in as {}", session_info.user.name)),
    }

    if let Some(storage) = &session_info.storage {
        let quota = StorageQuota::from(storage);
        if quota.is_exceeded() {
            ui::warn(&format!("Storage limit exceeded: {quota}"));
        } else {
            ui::info(&format!("Storage: {quota}"));
        }
    }

    match session_info.expires_at {
        Some(expires_at) => ui::info(&format!("Expires: {expires_at}")),
        None => ui::info("Token never expires"),
    }

    ui::info("Token saved to ~/.photodrop/config.json");
    Ok(())
}
