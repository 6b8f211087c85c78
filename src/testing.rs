//! In-process stand-ins for the backend collaborators.
//!
//! Each fake counts its calls and can be scripted to fail, so pipeline
//! behavior can be exercised without a network.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::models::{
    CompleteMultipartRequest, CompleteMultipartResponse, CreateMultipartResponse, FileSpec,
    ListPartsResponse, ListedItem, MultipartRef, MultipartUpload, PartUrl, PresignResponse,
    PresignedUrl, UploadedPart,
};
use crate::error::ServiceError;
use crate::quota::QuotaCheck;
use crate::services::{BlobPut, BlobStore, ListingService, PresignService};
use crate::session::{SessionObserver, SummaryKind, UploadSummary};
use crate::source::FileSource;
use crate::task::{FileStatus, ProgressSnapshot};
use crate::types::{UploadTarget, MIB};

pub const BLOB_URL_PREFIX: &str = "memory://blob/";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tracks the peak number of overlapping calls.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct ConcurrencyGuard<'a>(&'a Concurrency);

impl Concurrency {
    fn enter(&self) -> ConcurrencyGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard(self)
    }
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PresignState {
    presign_batches: Vec<Vec<FileSpec>>,
    multipart_batches: Vec<Vec<FileSpec>>,
    scripted_presign_failures: VecDeque<ServiceError>,
    failing_keys: HashSet<String>,
    omitted_keys: HashSet<String>,
    list_parts_failure: Option<ServiceError>,
    list_parts_calls: usize,
    existing_parts: HashMap<String, Vec<UploadedPart>>,
    uploads: HashMap<String, String>,
    completed: Vec<CompleteMultipartRequest>,
    aborted: Vec<MultipartRef>,
    next_upload: usize,
}

/// Metadata API fake. Object keys are rewritten as
/// `{resource}/{key_prefix}{file key}` to mimic backend key injection.
pub struct MemoryPresignService {
    key_prefix: String,
    part_size: u64,
    latency: Duration,
    metadata_written: bool,
    state: Mutex<PresignState>,
    concurrency: Concurrency,
}

impl Default for MemoryPresignService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresignService {
    pub fn new() -> Self {
        Self {
            key_prefix: String::new(),
            part_size: 8 * MIB,
            latency: Duration::ZERO,
            metadata_written: true,
            state: Mutex::new(PresignState::default()),
            concurrency: Concurrency::default(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_metadata_written(mut self, written: bool) -> Self {
        self.metadata_written = written;
        self
    }

    /// The next presign/create calls fail with these errors, in order.
    pub fn fail_next_calls(&self, errors: impl IntoIterator<Item = ServiceError>) {
        lock(&self.state).scripted_presign_failures.extend(errors);
    }

    /// Any batched call that includes `key` fails with HTTP 400.
    pub fn fail_batches_containing(&self, key: impl Into<String>) {
        lock(&self.state).failing_keys.insert(key.into());
    }

    /// Responses silently leave out `key`.
    pub fn omit_key(&self, key: impl Into<String>) {
        lock(&self.state).omitted_keys.insert(key.into());
    }

    pub fn fail_list_parts(&self, error: ServiceError) {
        lock(&self.state).list_parts_failure = Some(error);
    }

    /// Parts the store already holds for file `key`, as a resumed upload would.
    pub fn with_existing_parts(&self, key: impl Into<String>, parts: Vec<UploadedPart>) {
        lock(&self.state).existing_parts.insert(key.into(), parts);
    }

    pub fn object_key_for(&self, target: &UploadTarget, file_key: &str) -> String {
        format!("{}/{}{}", target.resource_id, self.key_prefix, file_key)
    }

    pub fn presign_calls(&self) -> usize {
        lock(&self.state).presign_batches.len()
    }

    pub fn multipart_calls(&self) -> usize {
        lock(&self.state).multipart_batches.len()
    }

    pub fn backend_calls(&self) -> usize {
        self.presign_calls() + self.multipart_calls()
    }

    pub fn presign_batches(&self) -> Vec<Vec<FileSpec>> {
        lock(&self.state).presign_batches.clone()
    }

    pub fn multipart_batches(&self) -> Vec<Vec<FileSpec>> {
        lock(&self.state).multipart_batches.clone()
    }

    pub fn list_parts_calls(&self) -> usize {
        lock(&self.state).list_parts_calls
    }

    pub fn completed(&self) -> Vec<CompleteMultipartRequest> {
        lock(&self.state).completed.clone()
    }

    pub fn aborted(&self) -> Vec<MultipartRef> {
        lock(&self.state).aborted.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    async fn begin_batch(&self, files: &[FileSpec], multipart: bool) -> Result<()> {
        let _guard = self.concurrency.enter();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = lock(&self.state);
        if multipart {
            state.multipart_batches.push(files.to_vec());
        } else {
            state.presign_batches.push(files.to_vec());
        }

        if let Some(err) = state.scripted_presign_failures.pop_front() {
            return Err(err.into());
        }
        if let Some(key) = files.iter().find(|f| state.failing_keys.contains(&f.key)) {
            return Err(ServiceError::status(400, format!("rejected batch containing {}", key.key)).into());
        }
        Ok(())
    }

    fn is_omitted(&self, key: &str) -> bool {
        lock(&self.state).omitted_keys.contains(key)
    }
}

#[async_trait]
impl PresignService for MemoryPresignService {
    async fn request_upload_parameters(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<PresignResponse> {
        self.begin_batch(files, false).await?;

        let urls = files
            .iter()
            .filter(|file| !self.is_omitted(&file.key))
            .map(|file| {
                let object_key = self.object_key_for(target, &file.key);
                PresignedUrl {
                    key: file.key.clone(),
                    url: format!("{BLOB_URL_PREFIX}{object_key}"),
                    object_key,
                    headers: HashMap::new(),
                }
            })
            .collect();

        Ok(PresignResponse { urls })
    }

    async fn create_multipart_upload(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<CreateMultipartResponse> {
        self.begin_batch(files, true).await?;

        let mut uploads = Vec::new();
        for file in files.iter().filter(|file| !self.is_omitted(&file.key)) {
            let object_key = self.object_key_for(target, &file.key);
            let total_parts = file.size.div_ceil(self.part_size).max(1) as u32;
            let upload_id = {
                let mut state = lock(&self.state);
                state.next_upload += 1;
                let upload_id = format!("upload-{}", state.next_upload);
                state.uploads.insert(upload_id.clone(), file.key.clone());
                upload_id
            };

            uploads.push(MultipartUpload {
                parts: (1..=total_parts)
                    .map(|part_number| PartUrl {
                        part_number,
                        url: format!("{BLOB_URL_PREFIX}{object_key}?uploadId={upload_id}&partNumber={part_number}"),
                    })
                    .collect(),
                upload_id,
                object_key,
                key: file.key.clone(),
                total_parts,
                part_size: self.part_size,
            });
        }

        Ok(CreateMultipartResponse { uploads })
    }

    async fn list_multipart_parts(
        &self,
        _target: &UploadTarget,
        upload: &MultipartRef,
    ) -> Result<ListPartsResponse> {
        let mut state = lock(&self.state);
        state.list_parts_calls += 1;
        if let Some(err) = state.list_parts_failure.clone() {
            return Err(err.into());
        }

        let parts = state
            .uploads
            .get(&upload.upload_id)
            .and_then(|file_key| state.existing_parts.get(file_key))
            .cloned()
            .unwrap_or_default();
        Ok(ListPartsResponse { parts })
    }

    async fn complete_multipart_upload(
        &self,
        _target: &UploadTarget,
        request: &CompleteMultipartRequest,
    ) -> Result<CompleteMultipartResponse> {
        lock(&self.state).completed.push(request.clone());
        Ok(CompleteMultipartResponse {
            location: Some(format!("{BLOB_URL_PREFIX}{}", request.key)),
            etag: Some(format!("{}-{}", request.upload_id, request.parts.len())),
            metadata_written: self.metadata_written,
        })
    }

    async fn abort_multipart_upload(
        &self,
        _target: &UploadTarget,
        upload: &MultipartRef,
    ) -> Result<()> {
        lock(&self.state).aborted.push(upload.clone());
        Ok(())
    }
}

type PutHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct BlobState {
    objects: HashMap<String, Bytes>,
    failing_urls: Vec<(String, ServiceError)>,
    puts: usize,
}

/// Blob store fake that keeps every PUT body in memory, keyed by URL.
pub struct MemoryBlobStore {
    latency: Duration,
    state: Mutex<BlobState>,
    hook: Mutex<Option<PutHook>>,
    concurrency: Concurrency,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            state: Mutex::new(BlobState::default()),
            hook: Mutex::new(None),
            concurrency: Concurrency::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// PUTs whose URL contains `fragment` fail with `error`.
    pub fn fail_urls_containing(&self, fragment: impl Into<String>, error: ServiceError) {
        lock(&self.state).failing_urls.push((fragment.into(), error));
    }

    /// Called with the URL at the start of every PUT.
    pub fn on_put(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.hook) = Some(Arc::new(hook));
    }

    pub fn puts(&self) -> usize {
        lock(&self.state).puts
    }

    pub fn object(&self, url: &str) -> Option<Bytes> {
        lock(&self.state).objects.get(url).cloned()
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = lock(&self.state).objects.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, request: BlobPut) -> Result<Option<String>> {
        let _guard = self.concurrency.enter();
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(&request.url);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let failure = {
            let mut state = lock(&self.state);
            state.puts += 1;
            state
                .failing_urls
                .iter()
                .find(|(fragment, _)| request.url.contains(fragment.as_str()))
                .map(|(_, err)| err.clone())
        };
        if let Some(err) = failure {
            return Err(err.into());
        }

        let bytes = match &request.body.source {
            FileSource::Memory(_) => request
                .body
                .memory_slice()
                .transpose()?
                .unwrap_or_default(),
            FileSource::Path(path) => {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let start = request.body.offset as usize;
                let end = start + request.body.length as usize;
                anyhow::ensure!(end <= data.len(), "range past end of {}", path.display());
                Bytes::copy_from_slice(&data[start..end])
            }
        };

        (request.progress)(bytes.len() as u64);
        let etag = format!("etag-{}", bytes.len());
        lock(&self.state).objects.insert(request.url, bytes);
        Ok(Some(etag))
    }
}

type ListingFn = Box<dyn FnMut(usize) -> Result<Vec<ListedItem>, ServiceError> + Send>;

#[derive(Default)]
struct ListingState {
    script: VecDeque<Result<Vec<ListedItem>, ServiceError>>,
    last: Vec<ListedItem>,
    calls: usize,
}

/// Listing fake that replays scripted snapshots. Once the script runs out
/// the last successful snapshot is repeated.
pub struct ScriptedListing {
    state: Mutex<ListingState>,
    generator: Mutex<Option<ListingFn>>,
}

impl Default for ScriptedListing {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedListing {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ListingState::default()),
            generator: Mutex::new(None),
        }
    }

    pub fn with_snapshots(snapshots: impl IntoIterator<Item = Vec<ListedItem>>) -> Self {
        let listing = Self::new();
        for snapshot in snapshots {
            listing.push_snapshot(snapshot);
        }
        listing
    }

    /// Computes each response from the zero-based call index.
    pub fn from_fn(
        generator: impl FnMut(usize) -> Result<Vec<ListedItem>, ServiceError> + Send + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(ListingState::default()),
            generator: Mutex::new(Some(Box::new(generator))),
        }
    }

    pub fn push_snapshot(&self, items: Vec<ListedItem>) {
        lock(&self.state).script.push_back(Ok(items));
    }

    pub fn push_error(&self, error: ServiceError) {
        lock(&self.state).script.push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).calls
    }
}

#[async_trait]
impl ListingService for ScriptedListing {
    async fn list_processed_items(&self, _target: &UploadTarget) -> Result<Vec<ListedItem>> {
        let call = {
            let mut state = lock(&self.state);
            state.calls += 1;
            state.calls - 1
        };

        if let Some(generator) = lock(&self.generator).as_mut() {
            return generator(call).map_err(Into::into);
        }

        let mut state = lock(&self.state);
        match state.script.pop_front() {
            Some(Ok(items)) => {
                state.last = items.clone();
                Ok(items)
            }
            Some(Err(err)) => Err(err.into()),
            None => Ok(state.last.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Progress { ready: usize, processing: usize, total: usize },
    ValidationNeeded(QuotaCheck),
    QuotaRecalculated(u64),
    Complete(SummaryKind),
    ReauthenticationRequired,
}

/// Observer that records every callback in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
    latest: Mutex<Option<ProgressSnapshot>>,
    summaries: Mutex<Vec<UploadSummary>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        lock(&self.events).clone()
    }

    pub fn latest_snapshot(&self) -> Option<ProgressSnapshot> {
        lock(&self.latest).clone()
    }

    pub fn summaries(&self) -> Vec<UploadSummary> {
        lock(&self.summaries).clone()
    }

    pub fn validations(&self) -> Vec<QuotaCheck> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::ValidationNeeded(check) => Some(check),
                _ => None,
            })
            .collect()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let count = |status: FileStatus| snapshot.iter().filter(|task| task.status == status).count();
        lock(&self.events).push(ObservedEvent::Progress {
            ready: count(FileStatus::Ready),
            processing: count(FileStatus::Processing),
            total: snapshot.len(),
        });
        *lock(&self.latest) = Some(snapshot.clone());
    }

    fn on_validation_needed(&self, check: &QuotaCheck) {
        lock(&self.events).push(ObservedEvent::ValidationNeeded(*check));
    }

    fn on_quota_recalculated(&self, transferred_bytes: u64) {
        lock(&self.events).push(ObservedEvent::QuotaRecalculated(transferred_bytes));
    }

    fn on_complete(&self, summary: &UploadSummary) {
        lock(&self.events).push(ObservedEvent::Complete(summary.kind()));
        lock(&self.summaries).push(summary.clone());
    }

    fn on_reauthentication_required(&self) {
        lock(&self.events).push(ObservedEvent::ReauthenticationRequired);
    }
}
