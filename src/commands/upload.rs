use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::api::ApiClient;
use crate::blob_store::HttpBlobStore;
use crate::commands::utils::{build_target, expand_tilde_path};
use crate::config::PipelineSettings;
use crate::exit_code::ExitCodeError;
use crate::quota::{QuotaCheck, StorageQuota};
use crate::session::{SessionObserver, SessionServices, SummaryKind, UploadSession, UploadSummary};
use crate::source::FileDescriptor;
use crate::task::{FileStatus, ProgressSnapshot};
use crate::types::{ByteSize, FileId};
use crate::ui;

/// Prints a line whenever a file changes status.
struct ConsoleObserver {
    seen: Mutex<HashMap<FileId, FileStatus>>,
    json: bool,
}

impl ConsoleObserver {
    fn new(json: bool) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            json,
        }
    }
}

impl SessionObserver for ConsoleObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if self.json {
            return;
        }
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in snapshot.iter() {
            if seen.insert(task.file_id, task.status) != Some(task.status)
                && task.status != FileStatus::Uploading
            {
                ui::info(&ui::task_line(task));
            }
        }
    }

    fn on_validation_needed(&self, check: &QuotaCheck) {
        ui::warn(&format!(
            "This upload brings storage to {} against a limit of {} ({} over). Free up space or upgrade before clients download.",
            ByteSize::new(check.uploaded_size_bytes),
            ByteSize::new(check.limit_bytes),
            ByteSize::new(check.excess_bytes)
        ));
    }

    fn on_quota_recalculated(&self, transferred_bytes: u64) {
        log::info!("Transfer phase done, {} bytes stored", transferred_bytes);
    }

    fn on_reauthentication_required(&self) {
        ui::warn("Your session expired while waiting for processing.");
    }
}

#[derive(Serialize)]
struct UploadReport<'a> {
    target: String,
    outcome: SummaryKind,
    success_count: usize,
    error_count: usize,
    cancelled_count: usize,
    pending_count: usize,
    transferred_bytes: u64,
    poll: Option<&'static str>,
    files: Vec<FileReport<'a>>,
}

#[derive(Serialize)]
struct FileReport<'a> {
    file_name: &'a str,
    status: FileStatus,
    remote_key: Option<&'a str>,
    error: Option<&'a str>,
}

fn report<'a>(target: String, summary: &UploadSummary, snapshot: &'a ProgressSnapshot) -> UploadReport<'a> {
    UploadReport {
        target,
        outcome: summary.kind(),
        success_count: summary.success_count,
        error_count: summary.error_count,
        cancelled_count: summary.cancelled_count,
        pending_count: summary.pending_count,
        transferred_bytes: summary.transferred_bytes,
        poll: summary.poll_outcome.as_ref().map(|outcome| outcome.label()),
        files: snapshot
            .iter()
            .map(|task| FileReport {
                file_name: &task.file_name,
                status: task.status,
                remote_key: task.remote_key.as_deref(),
                error: task.error_message(),
            })
            .collect(),
    }
}

/// Explicit usage wins; otherwise the account's storage from the session
/// endpoint, when it reports one.
async fn resolve_quota(
    api_client: &ApiClient,
    used_bytes: Option<u64>,
    limit_bytes: Option<u64>,
) -> Option<StorageQuota> {
    if let (Some(used), Some(limit)) = (used_bytes, limit_bytes) {
        return Some(StorageQuota::new(used, limit));
    }

    match api_client.get_session_info().await {
        Ok(info) => info.storage.as_ref().map(|storage| {
            let quota = StorageQuota::from(storage);
            StorageQuota::new(
                used_bytes.unwrap_or(quota.used_bytes),
                limit_bytes.unwrap_or(quota.limit_bytes),
            )
        }),
        Err(err) => {
            log::warn!("Could not read storage usage, skipping quota check: {:#}", err);
            None
        }
    }
}

async fn load_files(paths: &[String]) -> Result<Vec<FileDescriptor>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let path = PathBuf::from(expand_tilde_path(path));
        files.push(
            FileDescriptor::from_path(&path)
                .await
                .with_context(|| format!("Cannot upload {}", path.display()))?,
        );
    }
    Ok(files)
}

pub async fn execute(
    gallery: String,
    paths: Vec<String>,
    order: Option<String>,
    used_bytes: Option<u64>,
    limit_bytes: Option<u64>,
    verbose: bool,
    json_output: bool,
) -> Result<()> {
    let target = build_target(&gallery, order)?;
    let settings = PipelineSettings::load();
    let api_client = Arc::new(ApiClient::new()?);
    api_client.get_token()?;

    let files = load_files(&paths).await?;
    let total_bytes: u64 = files.iter().map(|file| file.byte_size).sum();
    let quota = resolve_quota(&api_client, used_bytes, limit_bytes).await;

    if verbose {
        ui::info(&format!(
            "Uploading {} file(s) ({}) to {}",
            files.len(),
            ByteSize::new(total_bytes),
            target
        ));
        if let Some(quota) = &quota {
            ui::info(&format!("Storage before upload: {quota}"));
        }
    }

    let services = SessionServices {
        presign: api_client.clone(),
        blob_store: Arc::new(HttpBlobStore::new(api_client.transfer_client().clone())),
        listing: api_client.clone(),
    };
    let mut session = UploadSession::new(
        target.clone(),
        services,
        settings,
        Arc::new(ConsoleObserver::new(json_output)),
    );
    if let Some(quota) = quota {
        session = session.with_quota(quota);
    }
    let session = Arc::new(session);

    let submission = session.submit(files)?;
    for name in submission.skipped() {
        ui::warn(&format!("Skipping {name}: not an image"));
    }

    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ui::warn("Cancelling; files already sent will finish processing");
                session.cancel();
            }
        })
    };

    let summary = session.run(submission).await;
    interrupt.abort();

    let snapshot = session.snapshot();
    if json_output {
        let report = report(target.to_string(), &summary, &snapshot);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        ui::upload_summary(&summary, &snapshot, &gallery);
    }

    match ExitCodeError::for_summary(&summary) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollOutcome;
    use crate::task::{FileTask, TaskStore};

    #[test]
    fn test_report_lists_every_file() {
        let store = TaskStore::new(200);
        let file = FileDescriptor::from_bytes("a.jpg", "image/jpeg", vec![0u8; 3]);
        store.seed(vec![FileTask::new(FileId(1), &file)]);
        store.set_remote_key(FileId(1), "g/a.jpg");
        store.mark_processing(FileId(1));
        store.mark_ready(FileId(1));

        let summary = UploadSummary {
            success_count: 1,
            error_count: 0,
            cancelled_count: 0,
            pending_count: 0,
            transferred_bytes: 3,
            poll_outcome: Some(PollOutcome::Converged { attempts: 1 }),
        };
        let snapshot = store.snapshot();
        let json = serde_json::to_value(report("gallery:g".into(), &summary, &snapshot)).unwrap();

        assert_eq!(json["outcome"], "all_succeeded");
        assert_eq!(json["poll"], "converged");
        assert_eq!(json["files"][0]["status"], "ready");
        assert_eq!(json["files"][0]["remote_key"], "g/a.jpg");
    }

    #[tokio::test]
    async fn test_load_files_reports_missing_path() {
        let err = load_files(&["/definitely/not/here.jpg".to_string()])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Cannot upload"));
    }
}
