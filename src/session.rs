//! The upload orchestrator.
//!
//! A session owns the task table of one upload destination. Each submission
//! resolves parameters through the [`RequestBatcher`], moves bytes with the
//! [`TransferEngine`] and then waits on the [`ConvergencePoller`] until the
//! backend lists every uploaded file as processed.

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::batcher::RequestBatcher;
use crate::config::PipelineSettings;
use crate::error::UploadError;
use crate::gate::ConcurrencyGate;
use crate::poller::{Baseline, ConvergencePoller, DeletedKeys, PollOutcome};
use crate::quota::{QuotaCheck, StorageQuota};
use crate::services::{BlobStore, ListingService, PresignService, ProgressFn};
use crate::source::FileDescriptor;
use crate::task::{FileTask, ProgressSnapshot, TaskStore};
use crate::transfer::{TransferEngine, TransferOutcome};
use crate::types::{FileId, UploadTarget};

/// Callbacks fired by a session. Every method defaults to a no-op.
///
/// `on_progress` runs synchronously inside task updates and must not call
/// back into the session.
pub trait SessionObserver: Send + Sync {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}

    fn on_validation_needed(&self, _check: &QuotaCheck) {}

    /// Fired once per submission after the transfer phase, before polling.
    fn on_quota_recalculated(&self, _transferred_bytes: u64) {}

    fn on_complete(&self, _summary: &UploadSummary) {}

    fn on_reauthentication_required(&self) {}
}

pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub success_count: usize,
    pub error_count: usize,
    pub cancelled_count: usize,
    /// Tasks left Uploading or Processing, which only happens on cancellation.
    pub pending_count: usize,
    pub transferred_bytes: u64,
    pub poll_outcome: Option<PollOutcome>,
}

impl UploadSummary {
    pub fn total(&self) -> usize {
        self.success_count + self.error_count + self.cancelled_count + self.pending_count
    }

    pub fn needs_reauthentication(&self) -> bool {
        matches!(
            self.poll_outcome,
            Some(PollOutcome::NeedsReauthentication { .. })
        )
    }

    pub fn kind(&self) -> SummaryKind {
        if self.cancelled_count > 0 || matches!(self.poll_outcome, Some(PollOutcome::Cancelled { .. }))
        {
            SummaryKind::Cancelled
        } else if self.success_count == 0 {
            SummaryKind::AllFailed
        } else if self.success_count == self.total() {
            SummaryKind::AllSucceeded
        } else {
            SummaryKind::PartialSuccess
        }
    }
}

impl std::fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            SummaryKind::AllSucceeded => {
                write!(f, "All {} file(s) uploaded and processed", self.success_count)
            }
            SummaryKind::PartialSuccess => write!(
                f,
                "{} of {} file(s) uploaded, {} failed",
                self.success_count,
                self.total(),
                self.error_count
            ),
            SummaryKind::AllFailed => write!(f, "All {} file(s) failed", self.total()),
            SummaryKind::Cancelled => write!(
                f,
                "Upload cancelled: {} done, {} cancelled, {} failed, {} unfinished",
                self.success_count, self.cancelled_count, self.error_count, self.pending_count
            ),
        }
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub presign: Arc<dyn PresignService>,
    pub blob_store: Arc<dyn BlobStore>,
    pub listing: Arc<dyn ListingService>,
}

struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Files accepted by [`UploadSession::submit`], waiting to be run. Dropping
/// it without running releases the session.
pub struct Submission {
    files: Vec<(FileId, FileDescriptor)>,
    skipped: Vec<String>,
    cancel: CancellationToken,
    _active: ActiveGuard,
}

impl Submission {
    pub fn file_ids(&self) -> Vec<FileId> {
        self.files.iter().map(|(id, _)| *id).collect()
    }

    /// Names of selected files that were not an accepted type.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

pub struct UploadSession {
    target: UploadTarget,
    settings: PipelineSettings,
    batcher: RequestBatcher,
    engine: TransferEngine,
    poller: ConvergencePoller,
    listing: Arc<dyn ListingService>,
    tasks: Arc<TaskStore>,
    observer: Arc<dyn SessionObserver>,
    quota: Mutex<Option<StorageQuota>>,
    deleted: DeletedKeys,
    cancel: Mutex<CancellationToken>,
    active: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl UploadSession {
    pub fn new(
        target: UploadTarget,
        services: SessionServices,
        settings: PipelineSettings,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let settings = settings.normalized();
        let gate = ConcurrencyGate::with_requeue(
            settings.batch_concurrency,
            settings.batch_requeue_limit,
            settings.retry.base_delay_for(0),
        );
        let progress_observer = observer.clone();
        let tasks = TaskStore::new(settings.error_message_limit).with_listener(Arc::new(
            move |snapshot: &ProgressSnapshot| progress_observer.on_progress(snapshot),
        ));

        Self {
            batcher: RequestBatcher::new(services.presign.clone(), gate, &settings),
            engine: TransferEngine::new(services.presign, services.blob_store, &settings),
            poller: ConvergencePoller::new(services.listing.clone(), &settings),
            listing: services.listing,
            tasks: Arc::new(tasks),
            observer,
            quota: Mutex::new(None),
            deleted: DeletedKeys::default(),
            cancel: Mutex::new(CancellationToken::new()),
            active: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            target,
            settings,
        }
    }

    /// Enables the crossing check that fires `on_validation_needed`.
    pub fn with_quota(self, quota: StorageQuota) -> Self {
        *lock(&self.quota) = Some(quota);
        self
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    pub fn quota(&self) -> Option<StorageQuota> {
        *lock(&self.quota)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tasks.snapshot()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ProgressSnapshot> {
        self.tasks.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Token of the current submission.
    pub fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Stops scheduling further work for the running submission. Tasks that
    /// are already Ready stay Ready.
    pub fn cancel(&self) {
        let token = lock(&self.cancel).clone();
        if !token.is_cancelled() {
            log::info!("Cancelling uploads to {}", self.target);
            token.cancel();
        }
    }

    /// Records a key the user deleted so polling will not bring it back.
    pub fn mark_deleted(&self, key: impl Into<String>) {
        self.deleted.insert(key);
    }

    /// Forgets every task. Refused while a submission runs.
    pub fn clear(&self) -> Result<(), UploadError> {
        if self.is_active() {
            return Err(UploadError::SubmissionInProgress);
        }
        self.tasks.clear();
        Ok(())
    }

    /// Validates a selection and seeds one Uploading task per accepted file.
    pub fn submit(&self, files: Vec<FileDescriptor>) -> Result<Submission, UploadError> {
        if !self.target.has_required_secondary_id() {
            return Err(UploadError::MissingSecondaryId {
                mode: self.target.mode.as_str(),
            });
        }

        let accepted_type = self.settings.accepted_content_type.as_str();
        let (accepted, rejected): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|file| file.matches_content_type(accepted_type));
        if accepted.is_empty() {
            return Err(UploadError::NoAcceptedFiles {
                accepted: accepted_type.to_string(),
            });
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(UploadError::SubmissionInProgress);
        }
        let active = ActiveGuard(self.active.clone());

        let skipped: Vec<String> = rejected.into_iter().map(|file| file.file_name).collect();
        for name in &skipped {
            log::warn!("Skipping {}: not an accepted file type", name);
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();

        let files: Vec<(FileId, FileDescriptor)> = accepted
            .into_iter()
            .map(|file| (FileId(self.next_id.fetch_add(1, Ordering::SeqCst)), file))
            .collect();
        self.tasks.seed(
            files
                .iter()
                .map(|(id, file)| FileTask::new(*id, file))
                .collect(),
        );

        log::info!("Submitted {} file(s) to {}", files.len(), self.target);
        Ok(Submission {
            files,
            skipped,
            cancel,
            _active: active,
        })
    }

    /// Submits and runs in one call.
    pub async fn upload(&self, files: Vec<FileDescriptor>) -> Result<UploadSummary, UploadError> {
        let submission = self.submit(files)?;
        Ok(self.run(submission).await)
    }

    /// Drives a submission to a terminal state and fires `on_complete` once.
    pub async fn run(&self, submission: Submission) -> UploadSummary {
        let Submission {
            files,
            cancel,
            _active,
            ..
        } = submission;
        let ids: Vec<FileId> = files.iter().map(|(id, _)| *id).collect();

        let baseline = self.capture_baseline().await;

        let transfers = files
            .iter()
            .map(|(id, file)| self.process_file(*id, file, &cancel));
        let transferred_bytes: u64 = join_all(transfers).await.into_iter().sum();

        let uploaded = self.tasks.tally(&ids).processing;
        let mut poll_outcome = None;
        if uploaded > 0 {
            self.recalculate_quota(transferred_bytes);

            let outcome = self
                .poller
                .poll(
                    &self.target,
                    &self.tasks,
                    &ids,
                    &baseline,
                    &self.deleted,
                    &cancel,
                )
                .await;
            if let PollOutcome::NeedsReauthentication { .. } = outcome {
                self.observer.on_reauthentication_required();
            }
            poll_outcome = Some(outcome);
        } else {
            log::info!("No file reached storage; skipping processing checks");
        }

        let tally = self.tasks.tally(&ids);
        let summary = UploadSummary {
            success_count: tally.ready,
            error_count: tally.error,
            cancelled_count: tally.cancelled,
            pending_count: tally.uploading + tally.processing,
            transferred_bytes,
            poll_outcome,
        };

        log::info!(
            "Submission to {} finished ({:?}): {} ready, {} failed, {} cancelled, {} pending",
            self.target,
            summary.kind(),
            summary.success_count,
            summary.error_count,
            summary.cancelled_count,
            summary.pending_count
        );
        self.observer.on_complete(&summary);
        summary
    }

    async fn capture_baseline(&self) -> Baseline {
        match self.listing.list_processed_items(&self.target).await {
            Ok(items) => Baseline::from_items(&items),
            Err(err) => {
                log::warn!(
                    "Could not read existing items of {}, assuming none: {:#}",
                    self.target,
                    err
                );
                Baseline::default()
            }
        }
    }

    /// Resolves parameters and transfers one file. Returns the bytes that
    /// reached storage.
    async fn process_file(
        &self,
        file_id: FileId,
        file: &FileDescriptor,
        cancel: &CancellationToken,
    ) -> u64 {
        if cancel.is_cancelled() {
            self.tasks.mark_cancelled(file_id);
            return 0;
        }

        let parameters = match self.batcher.enqueue(&self.target, file_id, file).await {
            Ok(parameters) => parameters,
            Err(err) => {
                log::warn!("No upload parameters for {}: {}", file.file_name, err);
                self.tasks.fail(file_id, err);
                return 0;
            }
        };
        self.tasks.set_remote_key(file_id, parameters.remote_key());

        let tasks = self.tasks.clone();
        let progress: ProgressFn = Arc::new(move |bytes| {
            tasks.add_progress(file_id, bytes);
        });

        match self
            .engine
            .transfer(&self.target, file, parameters, progress, cancel)
            .await
        {
            TransferOutcome::Uploaded { remote_key } => {
                self.tasks.set_remote_key(file_id, &remote_key);
                self.tasks.mark_processing(file_id);
                file.byte_size
            }
            TransferOutcome::Failed(err) => {
                self.tasks.fail(file_id, err);
                0
            }
            TransferOutcome::Cancelled => {
                self.tasks.mark_cancelled(file_id);
                0
            }
        }
    }

    fn recalculate_quota(&self, transferred_bytes: u64) {
        let check = {
            let mut quota = lock(&self.quota);
            match quota.as_mut() {
                Some(current) => {
                    let check = current.check(transferred_bytes);
                    *current = current.after(transferred_bytes);
                    check
                }
                None => None,
            }
        };

        if let Some(check) = check {
            log::warn!(
                "Upload to {} exceeds the storage limit by {} bytes",
                self.target,
                check.excess_bytes
            );
            self.observer.on_validation_needed(&check);
        }
        self.observer.on_quota_recalculated(transferred_bytes);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::ListedItem;
    use crate::retry::RetryPolicy;
    use crate::task::FileStatus;
    use crate::testing::{
        MemoryBlobStore, MemoryPresignService, ObservedEvent, RecordingObserver, ScriptedListing,
    };
    use std::time::Duration;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy::new(3, 100).without_jitter(),
            ..Default::default()
        }
    }

    fn image(name: &str) -> FileDescriptor {
        FileDescriptor::from_bytes(name, "image/jpeg", vec![9u8; 1_000])
    }

    struct Harness {
        presign: Arc<MemoryPresignService>,
        blobs: Arc<MemoryBlobStore>,
        listing: Arc<ScriptedListing>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn new(listing: ScriptedListing) -> Self {
            Self {
                presign: Arc::new(MemoryPresignService::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                listing: Arc::new(listing),
                observer: Arc::new(RecordingObserver::new()),
            }
        }

        fn session(&self, target: UploadTarget, settings: PipelineSettings) -> UploadSession {
            UploadSession::new(
                target,
                SessionServices {
                    presign: self.presign.clone(),
                    blob_store: self.blobs.clone(),
                    listing: self.listing.clone(),
                },
                settings,
                self.observer.clone(),
            )
        }
    }

    fn all_processed(names: &[&str]) -> ScriptedListing {
        let items: Vec<ListedItem> = names
            .iter()
            .map(|name| ListedItem::processed(format!("g/{name}")))
            .collect();
        ScriptedListing::with_snapshots([Vec::new(), items])
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_missing_order_id() {
        let harness = Harness::new(ScriptedListing::new());
        let mut target = UploadTarget::delivery("g", "o-1");
        target.secondary_id = None;
        let session = harness.session(target, settings());

        let err = session.submit(vec![image("a.jpg")]).err().unwrap();
        assert!(matches!(err, UploadError::MissingSecondaryId { mode: "delivery" }));
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_selection_without_images() {
        let harness = Harness::new(ScriptedListing::new());
        let session = harness.session(UploadTarget::gallery("g"), settings());

        let err = session
            .submit(vec![FileDescriptor::from_bytes("notes.txt", "text/plain", b"hi".to_vec())])
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::NoAcceptedFiles { .. }));
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_submission_at_a_time() {
        let harness = Harness::new(ScriptedListing::new());
        let session = harness.session(UploadTarget::gallery("g"), settings());

        let first = session
            .submit(vec![
                image("a.jpg"),
                FileDescriptor::from_bytes("notes.txt", "text/plain", b"hi".to_vec()),
            ])
            .unwrap();
        assert_eq!(first.skipped(), ["notes.txt".to_string()]);
        assert_eq!(session.snapshot().len(), 1);
        assert!(matches!(
            session.submit(vec![image("b.jpg")]).err().unwrap(),
            UploadError::SubmissionInProgress
        ));
        assert!(matches!(
            session.clear().unwrap_err(),
            UploadError::SubmissionInProgress
        ));

        drop(first);
        assert!(session.submit(vec![image("b.jpg")]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_transfer_stops_remaining_files_and_polling() {
        let harness = Harness::new(all_processed(&["a.jpg", "b.jpg", "c.jpg"]));
        let session = Arc::new(harness.session(
            UploadTarget::gallery("g"),
            PipelineSettings {
                file_concurrency: 1,
                ..settings()
            },
        ));

        let submission = session
            .submit(vec![image("a.jpg"), image("b.jpg"), image("c.jpg")])
            .unwrap();
        let cancelling = session.clone();
        harness.blobs.on_put(move |_| cancelling.cancel());

        let summary = session.run(submission).await;

        // The first PUT was already dispatched and completes; nothing after it starts.
        assert_eq!(harness.blobs.puts(), 1);
        assert_eq!(summary.cancelled_count, 2);
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.error_count, 0);
        assert_eq!(summary.kind(), SummaryKind::Cancelled);
        assert_eq!(summary.poll_outcome, Some(PollOutcome::Cancelled { attempts: 0 }));
        // Baseline only; no poll cycle ran.
        assert_eq!(harness.listing.calls(), 1);

        let cancelled: Vec<FileTask> = session
            .snapshot()
            .iter()
            .filter(|task| task.status == FileStatus::Cancelled)
            .cloned()
            .collect();
        assert!(cancelled
            .iter()
            .all(|task| matches!(task.error.as_ref().unwrap().cause, UploadError::Cancelled)));
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_session_is_reusable() {
        // One baseline per submission, then the poll for b.jpg.
        let harness = Harness::new(ScriptedListing::with_snapshots([
            Vec::new(),
            Vec::new(),
            vec![ListedItem::processed("g/b.jpg")],
        ]));
        let session = harness.session(UploadTarget::gallery("g"), settings());

        let submission = session.submit(vec![image("a.jpg")]).unwrap();
        session.cancel();
        session.cancel();
        let summary = session.run(submission).await;
        assert_eq!(summary.kind(), SummaryKind::Cancelled);
        assert_eq!(harness.presign.backend_calls(), 0);

        let summary = session.upload(vec![image("b.jpg")]).await.unwrap();
        assert_eq!(summary.kind(), SummaryKind::AllSucceeded);
        assert_eq!(summary.poll_outcome, Some(PollOutcome::Converged { attempts: 1 }));
        assert_eq!(session.snapshot().len(), 2);

        session.clear().unwrap();
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events_reflect_latest_snapshot() {
        let harness = Harness::new(all_processed(&["a.jpg", "b.jpg"]));
        let session = harness.session(UploadTarget::gallery("g"), settings());
        let mut updates = session.subscribe();

        let summary = session
            .upload(vec![image("a.jpg"), image("b.jpg")])
            .await
            .unwrap();

        assert_eq!(summary.kind(), SummaryKind::AllSucceeded);
        let latest = harness.observer.latest_snapshot().unwrap();
        assert!(latest.iter().all(|task| task.status == FileStatus::Ready));
        assert!(Arc::ptr_eq(&latest, &session.snapshot()));
        assert!(updates.has_changed().unwrap());
        assert!(updates
            .borrow_and_update()
            .iter()
            .all(|task| task.upload_progress_percent == 100));

        let completions = harness
            .observer
            .events()
            .into_iter()
            .filter(|event| matches!(event, ObservedEvent::Complete(_)))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_parameter_failures_skip_polling() {
        let harness = Harness::new(ScriptedListing::new());
        harness.presign.fail_batches_containing("a.jpg");
        let session = harness.session(UploadTarget::gallery("g"), settings());

        let summary = session
            .upload(vec![image("a.jpg"), image("b.jpg")])
            .await
            .unwrap();

        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.kind(), SummaryKind::AllFailed);
        assert_eq!(summary.poll_outcome, None);
        assert_eq!(harness.listing.calls(), 1);
        assert_eq!(harness.blobs.puts(), 0);
        assert!(!harness
            .observer
            .events()
            .iter()
            .any(|event| matches!(event, ObservedEvent::QuotaRecalculated(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credential_during_polling_is_reported() {
        let listing = ScriptedListing::new();
        listing.push_snapshot(Vec::new());
        listing.push_error(crate::error::ServiceError::AuthExpired("expired".into()));
        let harness = Harness::new(listing);
        let session = harness.session(UploadTarget::gallery("g"), settings());

        let summary = session.upload(vec![image("a.jpg")]).await.unwrap();

        assert!(summary.needs_reauthentication());
        assert_eq!(summary.error_count, 1);
        assert!(harness
            .observer
            .events()
            .contains(&ObservedEvent::ReauthenticationRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_keys_are_ignored_while_polling() {
        let harness = Harness::new(all_processed(&["a.jpg", "b.jpg"]));
        let session = harness.session(
            UploadTarget::gallery("g"),
            PipelineSettings {
                poll_max_attempts: 3,
                ..settings()
            },
        );
        session.mark_deleted("g/b.jpg");

        let started = tokio::time::Instant::now();
        let summary = session
            .upload(vec![image("a.jpg"), image("b.jpg")])
            .await
            .unwrap();

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.kind(), SummaryKind::PartialSuccess);
        assert_eq!(summary.poll_outcome, Some(PollOutcome::Exhausted { attempts: 3 }));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_summary_kinds_and_messages() {
        let summary = UploadSummary {
            success_count: 3,
            error_count: 2,
            cancelled_count: 0,
            pending_count: 0,
            transferred_bytes: 10,
            poll_outcome: Some(PollOutcome::Converged { attempts: 1 }),
        };
        assert_eq!(summary.kind(), SummaryKind::PartialSuccess);
        assert_eq!(summary.to_string(), "3 of 5 file(s) uploaded, 2 failed");

        let all = UploadSummary {
            error_count: 0,
            ..summary.clone()
        };
        assert_eq!(all.kind(), SummaryKind::AllSucceeded);

        let none = UploadSummary {
            success_count: 0,
            poll_outcome: None,
            ..summary
        };
        assert_eq!(none.kind(), SummaryKind::AllFailed);
    }
}
