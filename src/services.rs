use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::models::{
    CompleteMultipartRequest, CompleteMultipartResponse, CreateMultipartResponse, FileSpec,
    ListPartsResponse, ListedItem, MultipartRef, PresignResponse,
};
use crate::source::BlobBody;
use crate::types::UploadTarget;

/// Backend metadata API: hands out presigned URLs and drives multipart uploads.
#[async_trait]
pub trait PresignService: Send + Sync {
    async fn request_upload_parameters(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<PresignResponse>;

    async fn create_multipart_upload(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<CreateMultipartResponse>;

    async fn list_multipart_parts(
        &self,
        target: &UploadTarget,
        upload: &MultipartRef,
    ) -> Result<ListPartsResponse>;

    async fn complete_multipart_upload(
        &self,
        target: &UploadTarget,
        request: &CompleteMultipartRequest,
    ) -> Result<CompleteMultipartResponse>;

    /// Safe to call for an upload with no parts or one already aborted.
    async fn abort_multipart_upload(&self, target: &UploadTarget, upload: &MultipartRef)
        -> Result<()>;
}

/// Receives the number of bytes sent since the previous call.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

pub struct BlobPut {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub content_type: String,
    pub body: BlobBody,
    pub progress: ProgressFn,
}

impl std::fmt::Debug for BlobPut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobPut")
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("offset", &self.body.offset)
            .field("length", &self.body.length)
            .finish()
    }
}

/// Object storage reached through presigned URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// PUTs one body and returns the ETag reported by the store, if any.
    async fn put(&self, request: BlobPut) -> Result<Option<String>>;
}

/// Backend view of the images it has finished processing.
#[async_trait]
pub trait ListingService: Send + Sync {
    async fn list_processed_items(&self, target: &UploadTarget) -> Result<Vec<ListedItem>>;
}
