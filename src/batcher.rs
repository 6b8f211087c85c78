use anyhow::anyhow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::api::models::{FileSpec, MultipartUpload, PresignedUrl};
use crate::config::PipelineSettings;
use crate::error::UploadError;
use crate::gate::ConcurrencyGate;
use crate::retry::RetryPolicy;
use crate::services::PresignService;
use crate::source::FileDescriptor;
use crate::transfer::MultipartJob;
use crate::types::{FileId, TransferKind, UploadTarget};

/// What the transfer engine needs to move one file.
#[derive(Debug, Clone)]
pub enum TransferParameters {
    Single {
        url: String,
        remote_key: String,
        headers: HashMap<String, String>,
    },
    Multipart(MultipartJob),
}

impl TransferParameters {
    pub fn remote_key(&self) -> &str {
        match self {
            TransferParameters::Single { remote_key, .. } => remote_key,
            TransferParameters::Multipart(job) => &job.remote_key,
        }
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            TransferParameters::Single { .. } => TransferKind::Single,
            TransferParameters::Multipart(_) => TransferKind::Multipart,
        }
    }
}

type Responder = oneshot::Sender<Result<TransferParameters, UploadError>>;

struct PendingRequest {
    file_id: FileId,
    file: FileDescriptor,
    responder: Responder,
}

impl PendingRequest {
    fn spec(&self) -> FileSpec {
        FileSpec {
            key: self.file.file_name.clone(),
            content_type: self.file.content_type.clone(),
            size: self.file.byte_size,
        }
    }

    fn resolve(self, result: Result<TransferParameters, UploadError>) {
        // The caller may have gone away; its parameters are simply dropped.
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct BatchQueue {
    pending: Vec<PendingRequest>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    in_flight: usize,
}

impl BatchQueue {
    fn contains(&self, file_id: FileId) -> bool {
        self.pending.iter().any(|request| request.file_id == file_id)
    }

    /// Empties the queue in one step; later arrivals start a fresh batch.
    fn take_batch(&mut self) -> Vec<PendingRequest> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.in_flight += 1;
        std::mem::take(&mut self.pending)
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.timer.is_none() && self.in_flight == 0
    }
}

/// Coalesces per-file upload parameter requests into batched backend calls,
/// one queue per upload target.
///
/// A queue flushes when its window elapses or as soon as it holds
/// `max_batch_size` requests, whichever comes first. Each flush issues at most
/// one call per transfer kind, through the shared [`ConcurrencyGate`] and the
/// retry policy.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    presign: Arc<dyn PresignService>,
    gate: ConcurrencyGate,
    retry: RetryPolicy,
    window: Duration,
    max_batch_size: usize,
    multipart_threshold: u64,
    queues: Mutex<HashMap<UploadTarget, BatchQueue>>,
}

impl RequestBatcher {
    pub fn new(
        presign: Arc<dyn PresignService>,
        gate: ConcurrencyGate,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                presign,
                gate,
                retry: settings.retry,
                window: settings.batch_window(),
                max_batch_size: settings.max_batch_size.max(1),
                multipart_threshold: settings.multipart_threshold,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pending(&self, target: &UploadTarget) -> usize {
        self.inner
            .lock()
            .get(target)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, target: &UploadTarget) -> usize {
        self.inner
            .lock()
            .get(target)
            .map(|queue| queue.in_flight)
            .unwrap_or(0)
    }

    pub async fn enqueue(
        &self,
        target: &UploadTarget,
        file_id: FileId,
        file: &FileDescriptor,
    ) -> Result<TransferParameters, UploadError> {
        if !target.has_required_secondary_id() {
            return Err(UploadError::MissingSecondaryId {
                mode: target.mode.as_str(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let eager_batch = {
            let mut queues = self.inner.lock();
            if queues.values().any(|queue| queue.contains(file_id)) {
                return Err(UploadError::DuplicateFile(file_id));
            }

            let queue = queues.entry(target.clone()).or_default();
            queue.pending.push(PendingRequest {
                file_id,
                file: file.clone(),
                responder: tx,
            });

            if queue.pending.len() >= self.inner.max_batch_size {
                Some(queue.take_batch())
            } else {
                if queue.timer.is_none() {
                    queue.timer = Some(self.schedule_flush(target.clone(), queue.generation));
                }
                None
            }
        };

        if let Some(batch) = eager_batch {
            log::debug!("Batch for {} reached {} requests, flushing early", target, batch.len());
            let inner = self.inner.clone();
            let target = target.clone();
            tokio::spawn(async move { inner.dispatch(target, batch).await });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(UploadError::ParameterResolution(Arc::new(anyhow!(
                "batch for {} was dropped before it resolved",
                target
            )))),
        }
    }

    fn schedule_flush(&self, target: UploadTarget, generation: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            sleep(inner.window).await;
            let batch = {
                let mut queues = inner.lock();
                match queues.get_mut(&target) {
                    Some(queue) if queue.generation == generation => {
                        // Clear our own handle first so take_batch doesn't abort us.
                        queue.timer = None;
                        queue.take_batch()
                    }
                    _ => return,
                }
            };
            inner.dispatch(target, batch).await;
        })
    }
}

impl BatcherInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<UploadTarget, BatchQueue>> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn dispatch(&self, target: UploadTarget, batch: Vec<PendingRequest>) {
        let (multipart, single): (Vec<_>, Vec<_>) = batch.into_iter().partition(|request| {
            TransferKind::for_size(request.file.byte_size, self.multipart_threshold)
                == TransferKind::Multipart
        });

        log::info!(
            "Flushing upload parameter batch for {}: {} single, {} multipart",
            target,
            single.len(),
            multipart.len()
        );

        futures_util::future::join(
            self.dispatch_single(&target, single),
            self.dispatch_multipart(&target, multipart),
        )
        .await;

        let mut queues = self.lock();
        if let Some(queue) = queues.get_mut(&target) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
            if queue.is_idle() {
                queues.remove(&target);
            }
        }
    }

    async fn dispatch_single(&self, target: &UploadTarget, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }

        let specs: Vec<FileSpec> = requests.iter().map(PendingRequest::spec).collect();
        let gate_key = target.to_string();
        let presign = &self.presign;
        let specs_ref = &specs;

        let result = self
            .gate
            .run(&gate_key, move || {
                self.retry.execute("Request upload URLs", move || {
                    presign.request_upload_parameters(target, specs_ref)
                })
            })
            .await;

        match result {
            Ok(response) => {
                let mut matched = correlate(&requests, response.urls, |url: &PresignedUrl| {
                    url.key.as_str()
                });
                for (index, request) in requests.into_iter().enumerate() {
                    let outcome = match matched[index].take() {
                        Some(url) => Ok(TransferParameters::Single {
                            remote_key: url.object_key,
                            url: url.url,
                            headers: url.headers,
                        }),
                        None => Err(missing_parameters(&request)),
                    };
                    request.resolve(outcome);
                }
            }
            Err(err) => reject_all(target, requests, err),
        }
    }

    async fn dispatch_multipart(&self, target: &UploadTarget, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }

        let specs: Vec<FileSpec> = requests.iter().map(PendingRequest::spec).collect();
        let gate_key = target.to_string();
        let presign = &self.presign;
        let specs_ref = &specs;

        let result = self
            .gate
            .run(&gate_key, move || {
                self.retry.execute("Create multipart uploads", move || {
                    presign.create_multipart_upload(target, specs_ref)
                })
            })
            .await;

        match result {
            Ok(response) => {
                let mut matched = correlate(&requests, response.uploads, |upload: &MultipartUpload| {
                    upload.key.as_str()
                });
                for (index, request) in requests.into_iter().enumerate() {
                    let outcome = match matched[index].take() {
                        Some(upload) => Ok(TransferParameters::Multipart(MultipartJob::from_upload(
                            upload,
                            request.file.byte_size,
                        ))),
                        None => Err(missing_parameters(&request)),
                    };
                    request.resolve(outcome);
                }
            }
            Err(err) => reject_all(target, requests, err),
        }
    }
}

/// Pairs response entries with requests by their echoed key, falling back to
/// position when the backend omits keys.
fn correlate<T>(
    requests: &[PendingRequest],
    entries: Vec<T>,
    key_of: impl Fn(&T) -> &str,
) -> Vec<Option<T>> {
    let keyed = !entries.is_empty() && entries.iter().all(|entry| !key_of(entry).is_empty());

    if !keyed {
        let mut entries = entries.into_iter();
        return requests.iter().map(|_| entries.next()).collect();
    }

    let mut by_key: HashMap<String, VecDeque<T>> = HashMap::new();
    for entry in entries {
        by_key.entry(key_of(&entry).to_string()).or_default().push_back(entry);
    }

    requests
        .iter()
        .map(|request| {
            by_key
                .get_mut(&request.file.file_name)
                .and_then(VecDeque::pop_front)
        })
        .collect()
}

fn missing_parameters(request: &PendingRequest) -> UploadError {
    UploadError::ParameterResolution(Arc::new(anyhow!(
        "backend returned no upload parameters for {}",
        request.file.file_name
    )))
}

fn reject_all(target: &UploadTarget, requests: Vec<PendingRequest>, err: anyhow::Error) {
    log::error!(
        "Upload parameter batch for {} failed for {} file(s): {:#}",
        target,
        requests.len(),
        err
    );
    let shared = Arc::new(err);
    for request in requests {
        request.resolve(Err(UploadError::ParameterResolution(shared.clone())));
    }
}
