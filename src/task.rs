use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::error::{cap_message, UploadError};
use crate::source::FileDescriptor;
use crate::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploading,
    Processing,
    Ready,
    Error,
    Cancelled,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Processing => "processing",
            FileStatus::Ready => "ready",
            FileStatus::Error => "error",
            FileStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Ready | FileStatus::Error | FileStatus::Cancelled
        )
    }

    /// Allowed moves: Uploading to Processing, Error or Cancelled, and
    /// Processing to Ready or Error. Nothing leaves a terminal status.
    pub fn can_become(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing)
                | (Uploading, Error)
                | (Uploading, Cancelled)
                | (Processing, Ready)
                | (Processing, Error)
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TaskError {
    pub cause: UploadError,
    /// Display text, already shortened.
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct FileTask {
    pub file_id: FileId,
    pub file_name: String,
    pub byte_size: u64,
    pub content_type: String,
    pub status: FileStatus,
    pub upload_progress_percent: u8,
    pub remote_key: Option<String>,
    pub error: Option<TaskError>,
    bytes_sent: u64,
}

impl FileTask {
    pub fn new(file_id: FileId, file: &FileDescriptor) -> Self {
        Self {
            file_id,
            file_name: file.file_name.clone(),
            byte_size: file.byte_size,
            content_type: file.content_type.clone(),
            status: FileStatus::Uploading,
            upload_progress_percent: 0,
            remote_key: None,
            error: None,
            bytes_sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|err| err.message.as_str())
    }
}

pub type ProgressSnapshot = Arc<Vec<FileTask>>;
pub type SnapshotListener = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusTally {
    pub uploading: usize,
    pub processing: usize,
    pub ready: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl StatusTally {
    fn add(&mut self, status: FileStatus) {
        match status {
            FileStatus::Uploading => self.uploading += 1,
            FileStatus::Processing => self.processing += 1,
            FileStatus::Ready => self.ready += 1,
            FileStatus::Error => self.error += 1,
            FileStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Default)]
struct TaskState {
    tasks: Vec<FileTask>,
    version: u64,
}

/// The live task table of a session.
///
/// Every mutation rebuilds the snapshot; a published snapshot is never
/// touched again, so observers holding an old one are unaffected.
pub struct TaskStore {
    state: Mutex<TaskState>,
    sender: watch::Sender<ProgressSnapshot>,
    listener: Option<SnapshotListener>,
    delivered: Mutex<u64>,
    error_limit: usize,
}

impl TaskStore {
    pub fn new(error_limit: usize) -> Self {
        let (sender, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            state: Mutex::new(TaskState::default()),
            sender,
            listener: None,
            delivered: Mutex::new(0),
            error_limit,
        }
    }

    pub fn with_listener(mut self, listener: SnapshotListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.sender.subscribe()
    }

    pub fn get(&self, file_id: FileId) -> Option<FileTask> {
        self.lock()
            .tasks
            .iter()
            .find(|task| task.file_id == file_id)
            .cloned()
    }

    pub fn seed(&self, tasks: Vec<FileTask>) {
        self.mutate(|state| {
            state.tasks.extend(tasks);
            true
        });
    }

    pub fn clear(&self) {
        self.mutate(|state| {
            let changed = !state.tasks.is_empty();
            state.tasks.clear();
            changed
        });
    }

    pub fn set_remote_key(&self, file_id: FileId, remote_key: &str) -> bool {
        self.update(file_id, |task| {
            if task.remote_key.as_deref() == Some(remote_key) {
                return false;
            }
            task.remote_key = Some(remote_key.to_string());
            true
        })
    }

    /// Adds `bytes` to the task's sent count. Only publishes when the whole
    /// percentage changes.
    pub fn add_progress(&self, file_id: FileId, bytes: u64) -> bool {
        self.update(file_id, |task| {
            if task.status != FileStatus::Uploading {
                return false;
            }
            task.bytes_sent = task.bytes_sent.saturating_add(bytes).min(task.byte_size);
            let percent = percent_of(task.bytes_sent, task.byte_size);
            if percent == task.upload_progress_percent {
                return false;
            }
            task.upload_progress_percent = percent;
            true
        })
    }

    pub fn mark_processing(&self, file_id: FileId) -> bool {
        self.transition(file_id, FileStatus::Processing, None)
    }

    pub fn mark_ready(&self, file_id: FileId) -> bool {
        self.transition(file_id, FileStatus::Ready, None)
    }

    pub fn mark_cancelled(&self, file_id: FileId) -> bool {
        self.transition(file_id, FileStatus::Cancelled, Some(UploadError::Cancelled))
    }

    pub fn fail(&self, file_id: FileId, cause: UploadError) -> bool {
        self.transition(file_id, FileStatus::Error, Some(cause))
    }

    /// Applies a status change if the current status allows it. Returns
    /// whether anything changed.
    pub fn transition(
        &self,
        file_id: FileId,
        next: FileStatus,
        cause: Option<UploadError>,
    ) -> bool {
        let limit = self.error_limit;
        self.update(file_id, |task| {
            if !task.status.can_become(next) {
                log::debug!(
                    "Ignoring {} -> {} for {}",
                    task.status,
                    next,
                    task.file_name
                );
                return false;
            }

            log::debug!("{} is now {}", task.file_name, next);
            task.status = next;
            if next == FileStatus::Processing {
                task.bytes_sent = task.byte_size;
                task.upload_progress_percent = 100;
            }
            if matches!(next, FileStatus::Error | FileStatus::Cancelled) {
                task.error = cause.map(|cause| TaskError {
                    message: cap_message(&cause.to_string(), limit),
                    cause,
                });
            }
            true
        })
    }

    pub fn status_of(&self, file_id: FileId) -> Option<FileStatus> {
        self.lock()
            .tasks
            .iter()
            .find(|task| task.file_id == file_id)
            .map(|task| task.status)
    }

    pub fn tally(&self, ids: &[FileId]) -> StatusTally {
        let state = self.lock();
        let mut tally = StatusTally::default();
        for task in state.tasks.iter().filter(|task| ids.contains(&task.file_id)) {
            tally.add(task.status);
        }
        tally
    }

    fn update(&self, file_id: FileId, change: impl FnOnce(&mut FileTask) -> bool) -> bool {
        self.mutate(|state| {
            state
                .tasks
                .iter_mut()
                .find(|task| task.file_id == file_id)
                .map(change)
                .unwrap_or(false)
        })
    }

    fn mutate(&self, change: impl FnOnce(&mut TaskState) -> bool) -> bool {
        let published = {
            let mut state = self.lock();
            if !change(&mut *state) {
                return false;
            }
            state.version += 1;
            let snapshot: ProgressSnapshot = Arc::new(state.tasks.clone());
            self.sender.send_replace(snapshot.clone());
            (state.version, snapshot)
        };

        if let Some(listener) = &self.listener {
            let (version, snapshot) = published;
            let mut delivered = match self.delivered.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // A newer snapshot may already have been delivered by another
            // thread. The listener must not mutate this store.
            if version > *delivered {
                *delivered = version;
                listener(&snapshot);
            }
        }
        true
    }
}

fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u128::from(sent) * 100 / u128::from(total)).min(100)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_with(names: &[&str]) -> (TaskStore, Vec<FileId>) {
        let store = TaskStore::new(40);
        let ids: Vec<FileId> = (0..names.len() as u64).map(FileId).collect();
        store.seed(
            names
                .iter()
                .zip(&ids)
                .map(|(name, id)| {
                    FileTask::new(*id, &FileDescriptor::from_bytes(*name, "image/jpeg", vec![0u8; 200]))
                })
                .collect(),
        );
        (store, ids)
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let (store, ids) = store_with(&["a.jpg"]);
        let id = ids[0];

        assert!(!store.mark_ready(id), "cannot skip processing");
        assert!(store.mark_processing(id));
        assert!(!store.mark_processing(id));
        assert!(!store.mark_cancelled(id));
        assert!(store.mark_ready(id));
        assert!(!store.fail(id, UploadError::ConvergenceTimeout));
        assert_eq!(store.status_of(id), Some(FileStatus::Ready));
    }

    #[test]
    fn test_snapshots_are_never_mutated_in_place() {
        let (store, ids) = store_with(&["a.jpg", "b.jpg"]);
        let before = store.snapshot();

        store.mark_processing(ids[0]);
        let after = store.snapshot();

        assert_eq!(before[0].status, FileStatus::Uploading);
        assert_eq!(after[0].status, FileStatus::Processing);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_progress_publishes_on_percent_change_only() {
        let (store, ids) = store_with(&["a.jpg"]);
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        assert!(store.add_progress(ids[0], 100));
        assert_eq!(store.get(ids[0]).unwrap().upload_progress_percent, 50);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!store.add_progress(ids[0], 1));
        assert!(!rx.has_changed().unwrap());

        store.add_progress(ids[0], 10_000);
        assert_eq!(store.get(ids[0]).unwrap().upload_progress_percent, 100);
        assert_eq!(store.get(ids[0]).unwrap().bytes_sent(), 200);
    }

    #[test]
    fn test_error_message_is_capped() {
        let (store, ids) = store_with(&["a.jpg"]);
        store.fail(ids[0], UploadError::Transfer("x".repeat(500)));

        let task = store.get(ids[0]).unwrap();
        assert_eq!(task.status, FileStatus::Error);
        let message = task.error_message().unwrap();
        assert_eq!(message.chars().count(), 40);
        assert!(message.ends_with('…'));
    }

    #[test]
    fn test_listener_sees_every_published_snapshot() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let store = TaskStore::new(200).with_listener(Arc::new(move |snapshot| {
            counter.store(snapshot.len(), Ordering::SeqCst);
        }));

        let file = FileDescriptor::from_bytes("a.jpg", "image/jpeg", vec![1u8; 4]);
        store.seed(vec![FileTask::new(FileId(1), &file), FileTask::new(FileId(2), &file)]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        store.clear();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_tally_counts_only_requested_ids() {
        let (store, ids) = store_with(&["a.jpg", "b.jpg", "c.jpg"]);
        store.mark_processing(ids[0]);
        store.fail(ids[1], UploadError::Cancelled);

        let tally = store.tally(&ids[..2]);
        assert_eq!(tally.processing, 1);
        assert_eq!(tally.error, 1);
        assert_eq!(tally.uploading, 0);
    }
}
