use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::models::ListedItem;
use crate::config::PipelineSettings;
use crate::error::{is_auth_expired, UploadError};
use crate::services::ListingService;
use crate::task::{FileStatus, FileTask, TaskStore};
use crate::types::{FileId, UploadTarget};

/// Keys the user deleted while a submission was running. Shared between the
/// session and its poller; cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct DeletedKeys {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl DeletedKeys {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, key: impl Into<String>) -> bool {
        self.lock().insert(key.into())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Processed items already listed before a submission started.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    keys: HashSet<String>,
}

impl Baseline {
    pub fn from_items(items: &[ListedItem]) -> Self {
        Self {
            keys: items
                .iter()
                .filter(|item| item.is_processed())
                .filter_map(|item| item.identifier().map(str::to_string))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCycle {
    pub attempt: u32,
    pub max_attempts: u32,
    pub expected_count: usize,
    pub initial_count: usize,
}

impl PollCycle {
    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Converged { attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
    NeedsReauthentication { attempts: u32 },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Converged { attempts }
            | PollOutcome::Exhausted { attempts }
            | PollOutcome::Cancelled { attempts }
            | PollOutcome::NeedsReauthentication { attempts } => *attempts,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Converged { .. } => "converged",
            PollOutcome::Exhausted { .. } => "exhausted",
            PollOutcome::Cancelled { .. } => "cancelled",
            PollOutcome::NeedsReauthentication { .. } => "needs re-authentication",
        }
    }
}

/// Replaces characters a storage backend would rewrite in an object key.
pub fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether a listed identifier belongs to a submitted file. The backend may
/// prefix or rewrite keys, so an exact remote key is tried first, then the
/// file name as a suffix, then the sanitized file name anywhere in the key.
///
/// Fuzzy matches must start at a key segment: the name is either the whole
/// identifier or follows `/`, `-` or `_`. `a.jpg` never matches `g/banana.jpg`.
pub fn listing_matches(identifier: &str, remote_key: Option<&str>, file_name: &str) -> bool {
    match_rank(identifier, remote_key, file_name).is_some()
}

fn match_rank(identifier: &str, remote_key: Option<&str>, file_name: &str) -> Option<u8> {
    if identifier.is_empty() {
        return None;
    }
    if remote_key.is_some_and(|key| key == identifier) {
        return Some(0);
    }
    if !file_name.is_empty()
        && identifier.ends_with(file_name)
        && starts_segment(identifier, identifier.len() - file_name.len())
    {
        return Some(1);
    }
    let sanitized = sanitize_file_name(file_name);
    if !sanitized.is_empty()
        && identifier.match_indices(sanitized.as_str()).any(|(start, _)| {
            starts_segment(identifier, start)
                && ends_segment(identifier, start + sanitized.len())
        })
    {
        return Some(2);
    }
    None
}

fn starts_segment(identifier: &str, start: usize) -> bool {
    start == 0 || matches!(identifier.as_bytes()[start - 1], b'/' | b'-' | b'_')
}

fn ends_segment(identifier: &str, end: usize) -> bool {
    end == identifier.len() || matches!(identifier.as_bytes()[end], b'/' | b'-' | b'_' | b'.')
}

/// Watches the listing until every uploaded file shows up processed.
pub struct ConvergencePoller {
    listing: Arc<dyn ListingService>,
    interval: Duration,
    max_attempts: u32,
}

impl ConvergencePoller {
    pub fn new(listing: Arc<dyn ListingService>, settings: &PipelineSettings) -> Self {
        Self {
            listing,
            interval: settings.poll_interval(),
            max_attempts: settings.poll_max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Polls for the tasks in `file_ids` that are currently Processing.
    ///
    /// The first cycle runs immediately. A failed listing counts as an
    /// attempt, except an expired credential which stops the cycle at once.
    pub async fn poll(
        &self,
        target: &UploadTarget,
        tasks: &TaskStore,
        file_ids: &[FileId],
        baseline: &Baseline,
        deleted: &DeletedKeys,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let tracked: Vec<FileId> = file_ids
            .iter()
            .copied()
            .filter(|id| tasks.status_of(*id) == Some(FileStatus::Processing))
            .collect();

        let mut cycle = PollCycle {
            attempt: 0,
            max_attempts: self.max_attempts,
            expected_count: tracked.len(),
            initial_count: baseline.len(),
        };

        if cycle.expected_count == 0 {
            return PollOutcome::Converged { attempts: 0 };
        }

        log::info!(
            "Waiting for {} upload(s) to be processed in {} (baseline {} item(s))",
            cycle.expected_count,
            target,
            cycle.initial_count
        );

        let mut claimed: HashSet<String> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                log::info!("Polling for {} cancelled after {} cycle(s)", target, cycle.attempt);
                return PollOutcome::Cancelled {
                    attempts: cycle.attempt,
                };
            }

            let listing = self.listing.list_processed_items(target).await;
            if let Err(err) = &listing {
                if is_auth_expired(err) {
                    log::warn!("Credential expired while polling {}: {:#}", target, err);
                    for id in &tracked {
                        tasks.fail(*id, UploadError::AuthExpired);
                    }
                    return PollOutcome::NeedsReauthentication {
                        attempts: cycle.attempt,
                    };
                }
            }
            cycle.attempt += 1;

            match listing {
                Ok(items) => {
                    let processed = visible_processed(items, deleted);
                    let growth = processed
                        .iter()
                        .filter(|(identifier, _)| !baseline.contains(identifier))
                        .count();
                    let newly_ready =
                        apply_matches(tasks, &tracked, &processed, baseline, &mut claimed);
                    let tally = tasks.tally(&tracked);

                    log::info!(
                        "Poll {}/{} for {}: {} processed, {} new, {} ready (+{}), {} failed",
                        cycle.attempt,
                        cycle.max_attempts,
                        target,
                        processed.len(),
                        growth,
                        tally.ready,
                        newly_ready,
                        tally.error
                    );

                    if tally.ready + tally.error == cycle.expected_count
                        && growth >= cycle.expected_count
                    {
                        return PollOutcome::Converged {
                            attempts: cycle.attempt,
                        };
                    }
                }
                Err(err) => {
                    log::warn!(
                        "Poll {}/{} for {} failed: {:#}",
                        cycle.attempt,
                        cycle.max_attempts,
                        target,
                        err
                    );
                }
            }

            if cycle.is_last() {
                let mut timed_out = 0usize;
                for id in &tracked {
                    if tasks.fail(*id, UploadError::ConvergenceTimeout) {
                        timed_out += 1;
                    }
                }
                log::warn!(
                    "Gave up waiting on {} after {} cycles; {} upload(s) never appeared processed",
                    target,
                    cycle.attempt,
                    timed_out
                );
                return PollOutcome::Exhausted {
                    attempts: cycle.attempt,
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Polling for {} cancelled after {} cycle(s)", target, cycle.attempt);
                    return PollOutcome::Cancelled { attempts: cycle.attempt };
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Processed, non-deleted items as `(identifier, item)` pairs.
fn visible_processed(items: Vec<ListedItem>, deleted: &DeletedKeys) -> Vec<(String, ListedItem)> {
    items
        .into_iter()
        .filter(ListedItem::is_processed)
        .filter_map(|item| {
            let identifier = item.identifier()?.to_string();
            if deleted.contains(&identifier) {
                return None;
            }
            Some((identifier, item))
        })
        .collect()
}

/// Flips matched Processing tasks to Ready. Each listed item is claimed by at
/// most one task, and a claim survives across cycles. Items in the baseline
/// predate the submission and are never claimed, not even by an exact key.
fn apply_matches(
    tasks: &TaskStore,
    tracked: &[FileId],
    processed: &[(String, ListedItem)],
    baseline: &Baseline,
    claimed: &mut HashSet<String>,
) -> usize {
    let mut pending: Vec<FileTask> = tracked
        .iter()
        .filter_map(|id| tasks.get(*id))
        .filter(|task| task.status == FileStatus::Processing)
        .collect();

    let mut newly_ready = 0;
    // Exact matches first so a fuzzy match cannot steal another file's item.
    for rank in 0..=2u8 {
        pending.retain(|task| {
            let found = processed.iter().find(|(identifier, _)| {
                !claimed.contains(identifier)
                    && !baseline.contains(identifier)
                    && match_rank(identifier, task.remote_key.as_deref(), &task.file_name) == Some(rank)
            });
            match found {
                Some((identifier, _)) => {
                    claimed.insert(identifier.clone());
                    if tasks.mark_ready(task.file_id) {
                        newly_ready += 1;
                    }
                    false
                }
                None => true,
            }
        });
    }
    newly_ready
}
