use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::api::models::{
    CompleteMultipartRequest, CompletedPart, MultipartRef, MultipartUpload, UploadedPart,
};
use crate::batcher::TransferParameters;
use crate::config::PipelineSettings;
use crate::error::UploadError;
use crate::retry::RetryPolicy;
use crate::services::{BlobPut, BlobStore, PresignService, ProgressFn};
use crate::source::FileDescriptor;
use crate::types::UploadTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub part_number: u32,
    pub url: String,
    pub etag: Option<String>,
}

/// One large-file upload in progress.
#[derive(Debug, Clone)]
pub struct MultipartJob {
    pub upload_id: String,
    pub remote_key: String,
    pub parts: Vec<MultipartPart>,
    pub part_size: u64,
    pub total_parts: u32,
    pub file_size: u64,
}

impl MultipartJob {
    pub fn from_upload(upload: MultipartUpload, file_size: u64) -> Self {
        let mut parts: Vec<MultipartPart> = upload
            .parts
            .into_iter()
            .map(|part| MultipartPart {
                part_number: part.part_number,
                url: part.url,
                etag: None,
            })
            .collect();
        parts.sort_by_key(|part| part.part_number);

        Self {
            upload_id: upload.upload_id,
            remote_key: upload.object_key,
            parts,
            part_size: upload.part_size,
            total_parts: upload.total_parts,
            file_size,
        }
    }

    pub fn reference(&self) -> MultipartRef {
        MultipartRef {
            upload_id: self.upload_id.clone(),
            key: self.remote_key.clone(),
        }
    }

    /// Byte range `(offset, length)` covered by a 1-based part number.
    pub fn part_range(&self, part_number: u32) -> (u64, u64) {
        let offset = u64::from(part_number.saturating_sub(1)).saturating_mul(self.part_size);
        let length = self.file_size.saturating_sub(offset).min(self.part_size);
        (offset, length)
    }

    pub fn record_etag(&mut self, part_number: u32, etag: String) -> bool {
        match self.parts.iter_mut().find(|part| part.part_number == part_number) {
            Some(part) => {
                part.etag = Some(etag);
                true
            }
            None => false,
        }
    }

    pub fn missing_parts(&self) -> impl Iterator<Item = &MultipartPart> {
        self.parts.iter().filter(|part| part.etag.is_none())
    }

    /// Every expected part is present and carries an ETag.
    pub fn is_complete(&self) -> bool {
        self.parts.len() == self.total_parts as usize
            && self.parts.iter().all(|part| part.etag.is_some())
    }

    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .filter_map(|part| {
                part.etag.as_ref().map(|etag| CompletedPart {
                    part_number: part.part_number,
                    etag: etag.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Uploaded { remote_key: String },
    Failed(UploadError),
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Uploaded { .. })
    }
}

enum PartFailure {
    Cancelled,
    Failed(anyhow::Error),
}

struct PartWork {
    part_number: u32,
    url: String,
    offset: u64,
    length: u64,
}

/// Moves file bytes to blob storage, by single PUT or multipart.
///
/// File transfers share one semaphore and part uploads another, so the
/// configured limits hold across every file of a submission.
pub struct TransferEngine {
    presign: Arc<dyn PresignService>,
    blob_store: Arc<dyn BlobStore>,
    file_slots: Arc<Semaphore>,
    part_slots: Arc<Semaphore>,
    part_concurrency: usize,
    retry: RetryPolicy,
}

impl TransferEngine {
    pub fn new(
        presign: Arc<dyn PresignService>,
        blob_store: Arc<dyn BlobStore>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            presign,
            blob_store,
            file_slots: Arc::new(Semaphore::new(settings.file_concurrency.max(1))),
            part_slots: Arc::new(Semaphore::new(settings.part_concurrency.max(1))),
            part_concurrency: settings.part_concurrency.max(1),
            retry: settings.retry,
        }
    }

    pub async fn transfer(
        &self,
        target: &UploadTarget,
        file: &FileDescriptor,
        parameters: TransferParameters,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        let _permit = match self.file_slots.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return TransferOutcome::Failed(UploadError::Transfer(format!(
                    "transfer slots closed before {} started: {}",
                    file.file_name, err
                )))
            }
        };

        if cancel.is_cancelled() {
            if let TransferParameters::Multipart(job) = &parameters {
                self.abort(target, job).await;
            }
            log::debug!("Skipping {}: upload cancelled", file.file_name);
            return TransferOutcome::Cancelled;
        }

        match parameters {
            TransferParameters::Single {
                url,
                remote_key,
                headers,
            } => self.transfer_single(file, url, remote_key, headers, progress).await,
            TransferParameters::Multipart(job) => {
                self.transfer_multipart(target, file, job, progress, cancel)
                    .await
            }
        }
    }

    async fn transfer_single(
        &self,
        file: &FileDescriptor,
        url: String,
        remote_key: String,
        headers: HashMap<String, String>,
        progress: ProgressFn,
    ) -> TransferOutcome {
        let request = BlobPut {
            url,
            headers,
            content_type: file.content_type.clone(),
            body: file.body(),
            progress,
        };

        match self.blob_store.put(request).await {
            Ok(_) => {
                log::debug!("Uploaded {} as {}", file.file_name, remote_key);
                TransferOutcome::Uploaded { remote_key }
            }
            Err(err) => {
                log::warn!("Upload of {} failed: {:#}", file.file_name, err);
                TransferOutcome::Failed(UploadError::Transfer(format!("{:#}", err)))
            }
        }
    }

    async fn transfer_multipart(
        &self,
        target: &UploadTarget,
        file: &FileDescriptor,
        mut job: MultipartJob,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        log::info!(
            "Starting multipart upload of {} ({} parts of {} bytes)",
            file.file_name,
            job.total_parts,
            job.part_size
        );

        if let Err(err) = self.validate_job(&job) {
            self.abort(target, &job).await;
            return TransferOutcome::Failed(UploadError::Transfer(format!("{:#}", err)));
        }

        self.apply_existing_parts(target, &mut job, &progress).await;

        let work: Vec<PartWork> = job
            .missing_parts()
            .map(|part| {
                let (offset, length) = job.part_range(part.part_number);
                PartWork {
                    part_number: part.part_number,
                    url: part.url.clone(),
                    offset,
                    length,
                }
            })
            .collect();

        let mut uploads = futures_util::stream::iter(work)
            .map(|part| self.upload_part(file, part, progress.clone(), cancel))
            .buffer_unordered(self.part_concurrency);

        let mut failure = None;
        while let Some(result) = uploads.next().await {
            match result {
                Ok((part_number, etag)) => {
                    job.record_etag(part_number, etag);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(uploads);

        if failure.is_none() && cancel.is_cancelled() {
            failure = Some(PartFailure::Cancelled);
        }

        match failure {
            Some(PartFailure::Cancelled) => {
                log::info!("Multipart upload of {} cancelled, aborting", file.file_name);
                self.abort(target, &job).await;
                return TransferOutcome::Cancelled;
            }
            Some(PartFailure::Failed(err)) => {
                log::warn!("Multipart upload of {} failed: {:#}", file.file_name, err);
                self.abort(target, &job).await;
                return TransferOutcome::Failed(UploadError::Transfer(format!("{:#}", err)));
            }
            None => {}
        }

        if !job.is_complete() {
            self.abort(target, &job).await;
            return TransferOutcome::Failed(UploadError::Transfer(format!(
                "only {} of {} parts of {} were uploaded",
                job.completed_parts().len(),
                job.total_parts,
                file.file_name
            )));
        }

        match self.complete(target, &job).await {
            Ok(()) => {
                log::info!("Completed multipart upload of {}", file.file_name);
                TransferOutcome::Uploaded {
                    remote_key: job.remote_key,
                }
            }
            Err(err) => {
                log::warn!("Completing {} failed: {:#}", file.file_name, err);
                self.abort(target, &job).await;
                TransferOutcome::Failed(UploadError::Transfer(format!("{:#}", err)))
            }
        }
    }

    fn validate_job(&self, job: &MultipartJob) -> Result<()> {
        anyhow::ensure!(job.part_size > 0, "multipart upload {} has zero part size", job.upload_id);
        anyhow::ensure!(
            job.parts.len() == job.total_parts as usize,
            "multipart upload {} lists {} part URLs for {} parts",
            job.upload_id,
            job.parts.len(),
            job.total_parts
        );
        anyhow::ensure!(
            u64::from(job.total_parts).saturating_mul(job.part_size) >= job.file_size,
            "multipart upload {} cannot hold {} bytes",
            job.upload_id,
            job.file_size
        );
        anyhow::ensure!(
            job.file_size == 0
                || u64::from(job.total_parts.saturating_sub(1)).saturating_mul(job.part_size)
                    < job.file_size,
            "multipart upload {} splits {} bytes into {} parts of {}, leaving an empty part",
            job.upload_id,
            job.file_size,
            job.total_parts,
            job.part_size
        );
        Ok(())
    }

    /// Parts the store already holds count as uploaded. A failed lookup is
    /// treated as "nothing uploaded yet".
    async fn apply_existing_parts(
        &self,
        target: &UploadTarget,
        job: &mut MultipartJob,
        progress: &ProgressFn,
    ) {
        let existing = match self
            .presign
            .list_multipart_parts(target, &job.reference())
            .await
        {
            Ok(response) => response.parts,
            Err(err) => {
                log::warn!(
                    "Could not list uploaded parts of {}, uploading from part 1: {:#}",
                    job.remote_key,
                    err
                );
                return;
            }
        };

        let mut resumed = 0usize;
        for UploadedPart {
            part_number,
            etag,
            size,
        } in existing
        {
            let (_, expected) = job.part_range(part_number);
            if etag.is_empty() || (size != 0 && size != expected) {
                continue;
            }
            if job.record_etag(part_number, etag) {
                progress(expected);
                resumed += 1;
            }
        }

        if resumed > 0 {
            log::info!(
                "Resuming {}: {} of {} parts already uploaded",
                job.remote_key,
                resumed,
                job.total_parts
            );
        }
    }

    async fn upload_part(
        &self,
        file: &FileDescriptor,
        part: PartWork,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(u32, String), PartFailure> {
        let _permit = self
            .part_slots
            .acquire()
            .await
            .context("part upload slots closed")
            .map_err(PartFailure::Failed)?;
        if cancel.is_cancelled() {
            return Err(PartFailure::Cancelled);
        }

        log::debug!(
            "Uploading part {} of {} at offset {} ({} bytes)",
            part.part_number,
            file.file_name,
            part.offset,
            part.length
        );

        let request = BlobPut {
            url: part.url,
            headers: HashMap::new(),
            content_type: file.content_type.clone(),
            body: file.range(part.offset, part.length),
            progress,
        };

        let etag = self
            .blob_store
            .put(request)
            .await
            .with_context(|| format!("Failed to upload part {}", part.part_number))
            .and_then(|etag| {
                etag.ok_or_else(|| anyhow!("Upload response missing ETag for part {}", part.part_number))
            })
            .map_err(PartFailure::Failed)?;

        Ok((part.part_number, etag))
    }

    async fn complete(&self, target: &UploadTarget, job: &MultipartJob) -> Result<()> {
        let request = CompleteMultipartRequest {
            upload_id: job.upload_id.clone(),
            key: job.remote_key.clone(),
            parts: job.completed_parts(),
            file_size: job.file_size,
        };
        let presign = &self.presign;
        let request_ref = &request;

        let response = self
            .retry
            .execute("Complete multipart upload", move || {
                presign.complete_multipart_upload(target, request_ref)
            })
            .await?;

        if !response.metadata_written {
            log::warn!(
                "Upload {} completed but the backend did not record its metadata yet",
                job.remote_key
            );
        }
        Ok(())
    }

    /// Best effort; failures are logged and swallowed.
    async fn abort(&self, target: &UploadTarget, job: &MultipartJob) {
        match self
            .presign
            .abort_multipart_upload(target, &job.reference())
            .await
        {
            Ok(()) => log::info!("Aborted multipart upload {}", job.remote_key),
            Err(err) => log::warn!(
                "Failed to abort multipart upload {}: {:#}",
                job.remote_key,
                err
            ),
        }
    }
}
