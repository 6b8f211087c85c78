use anyhow::Result;
use serde::Serialize;
use std::time::Instant;

use crate::api::{ApiClient, ListedItem};
use crate::commands::utils::{build_target, get_gallery_id};
use crate::ui;

#[derive(Debug, Serialize)]
struct LsItem {
    key: String,
    status: &'static str,
    thumb_url: Option<String>,
    final_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct LsSummary {
    gallery: String,
    order: Option<String>,
    total: usize,
    processed: usize,
    items: Vec<LsItem>,
}

fn to_ls_item(item: ListedItem) -> LsItem {
    LsItem {
        status: if item.is_processed() {
            "processed"
        } else {
            "pending"
        },
        key: item.identifier().unwrap_or("(unnamed)").to_string(),
        thumb_url: item.thumb_url,
        final_url: item.final_url.or(item.url),
    }
}

pub async fn execute(
    gallery_option: Option<String>,
    order: Option<String>,
    verbose: bool,
    json_output: bool,
) -> Result<()> {
    let gallery = get_gallery_id(gallery_option)?;
    let target = build_target(&gallery, order.clone())?;
    let start_time = Instant::now();
    let api_client = ApiClient::new()?;

    if verbose {
        ui::info(&format!("Listing images for: {target}"));
    }

    let mut items: Vec<LsItem> = api_client
        .list_images(&target)
        .await?
        .into_iter()
        .map(to_ls_item)
        .collect();
    items.sort_by(|a, b| a.key.cmp(&b.key));
    let processed = items.iter().filter(|item| item.status == "processed").count();

    if json_output {
        let summary = LsSummary {
            gallery,
            order,
            total: items.len(),
            processed,
            items,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if items.is_empty() {
        ui::info(&format!("No images found for gallery: {gallery}"));
        return Ok(());
    }

    println!();
    println!("{:<56} {:<10}", "KEY", "STATUS");
    println!("{}", "-".repeat(67));
    for item in &items {
        let key = if item.key.chars().count() > 56 {
            let head: String = item.key.chars().take(53).collect();
            format!("{head}...")
        } else {
            item.key.clone()
        };
        println!("{:<56} {:<10}", key, item.status);
        if verbose {
            if let Some(url) = item.thumb_url.as_deref().or(item.final_url.as_deref()) {
                println!("    {url}");
            }
        }
    }

    ui::blank_line();
    ui::info(&format!(
        "{} image(s), {} processed ({:.1}s)",
        items.len(),
        processed,
        start_time.elapsed().as_secs_f64()
    ));
    Ok(())
}
