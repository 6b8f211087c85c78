use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ServiceError;
use crate::services::{BlobPut, BlobStore, ProgressFn};
use crate::source::FileSource;

const STREAM_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Streams file ranges to presigned URLs. Failed PUTs are reported, never
/// retried here.
#[derive(Clone)]
pub struct HttpBlobStore {
    client: Client,
}

impl HttpBlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, request: BlobPut) -> Result<Option<String>> {
        let BlobPut {
            url,
            headers,
            content_type,
            body,
            progress,
        } = request;

        let length = body.length;
        let stream_body = match &body.source {
            FileSource::Path(path) => {
                let rx = spawn_range_reader(path, body.offset, length, progress).await?;
                reqwest::Body::wrap_stream(ReceiverStream::new(rx))
            }
            FileSource::Memory(_) => {
                let slice = body.memory_slice().transpose()?.unwrap_or_default();
                reqwest::Body::wrap_stream(memory_stream(slice, progress))
            }
        };

        let mut builder = self.client.put(&url);
        if !has_header(&headers, "content-type") {
            builder = builder.header("content-type", content_type.as_str());
        }
        if !has_header(&headers, "content-length") {
            builder = builder.header("content-length", length.to_string());
        }
        for (key, value) in &headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .body(stream_body)
            .send()
            .await
            .map_err(ServiceError::from)
            .context("Blob upload failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            log::error!("Blob upload failed: HTTP {} - {}", status, error_body);
            let message = if error_body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                error_body
            };
            return Err(ServiceError::status(status.as_u16(), message).into());
        }

        Ok(extract_etag(&response))
    }
}

fn memory_stream(
    bytes: Bytes,
    progress: ProgressFn,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(STREAM_CHUNK_SIZE)
        .map(|start| bytes.slice(start..(start + STREAM_CHUNK_SIZE).min(bytes.len())))
        .collect();

    futures_util::stream::iter(chunks).map(move |chunk| {
        progress(chunk.len() as u64);
        Ok(chunk)
    })
}

async fn spawn_range_reader(
    path: &Path,
    offset: u64,
    length: u64,
    progress: ProgressFn,
) -> Result<tokio::sync::mpsc::Receiver<std::io::Result<Bytes>>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = tokio::io::BufReader::with_capacity(STREAM_CHUNK_SIZE, file);
    reader
        .seek(tokio::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("Failed to seek {} to {}", path.display(), offset))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);

    tokio::spawn(async move {
        let mut remaining = length;
        while remaining > 0 {
            let to_read = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
            let mut buffer = vec![0u8; to_read];
            if let Err(err) = reader.read_exact(&mut buffer).await {
                let _ = tx.send(Err(err)).await;
                return;
            }
            remaining -= to_read as u64;
            if tx.send(Ok(Bytes::from(buffer))).await.is_err() {
                return;
            }
            progress(to_read as u64);
        }
    });

    Ok(rx)
}

fn extract_etag(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("etag")
        .and_then(|header| header.to_str().ok())
        .map(|etag| etag.trim_matches('"').to_string())
        .filter(|etag| !etag.is_empty())
}

fn has_header(headers: &HashMap<String, String>, target: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::is_retryable_error;
    use crate::source::FileDescriptor;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn networking_available() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn counting_progress() -> (ProgressFn, Arc<AtomicU64>) {
        let total = Arc::new(AtomicU64::new(0));
        let counter = total.clone();
        let progress: ProgressFn = Arc::new(move |bytes| {
            counter.fetch_add(bytes, Ordering::SeqCst);
        });
        (progress, total)
    }

    #[tokio::test]
    async fn test_put_memory_body_returns_trimmed_etag() {
        if !networking_available() {
            eprintln!("skipping test_put_memory_body_returns_trimmed_etag: networking disabled in sandbox");
            return;
        }

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/bucket/a.jpg")
            .match_header("content-type", "image/jpeg")
            .match_header("content-length", "10")
            .match_header("x-amz-acl", "private")
            .match_body("0123456789")
            .with_status(200)
            .with_header("etag", "\"abc123\"")
            .create_async()
            .await;

        let file = FileDescriptor::from_bytes("a.jpg", "image/jpeg", b"0123456789".to_vec());
        let (progress, total) = counting_progress();
        let store = HttpBlobStore::new(Client::new());

        let etag = store
            .put(BlobPut {
                url: format!("{}/bucket/a.jpg", server.url()),
                headers: HashMap::from([("x-amz-acl".to_string(), "private".to_string())]),
                content_type: file.content_type.clone(),
                body: file.body(),
                progress,
            })
            .await
            .unwrap();

        assert_eq!(etag.as_deref(), Some("abc123"));
        assert_eq!(total.load(Ordering::SeqCst), 10);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_streams_file_range() {
        if !networking_available() {
            eprintln!("skipping test_put_streams_file_range: networking disabled in sandbox");
            return;
        }

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("big.tif");
        std::fs::write(&path, b"0123456789").unwrap();
        let file = FileDescriptor::from_path(&path).await.unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/part/2")
            .match_header("content-length", "4")
            .match_body("3456")
            .with_status(200)
            .with_header("etag", "part-2")
            .create_async()
            .await;

        let (progress, total) = counting_progress();
        let store = HttpBlobStore::new(Client::new());
        let etag = store
            .put(BlobPut {
                url: format!("{}/part/2", server.url()),
                headers: HashMap::new(),
                content_type: file.content_type.clone(),
                body: file.range(3, 4),
                progress,
            })
            .await
            .unwrap();

        assert_eq!(etag.as_deref(), Some("part-2"));
        assert_eq!(total.load(Ordering::SeqCst), 4);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_typed_failure() {
        if !networking_available() {
            eprintln!("skipping test_non_success_status_is_a_typed_failure: networking disabled in sandbox");
            return;
        }

        let mut server = mockito::Server::new_async().await;
        let _forbidden = server
            .mock("PUT", "/expired")
            .with_status(403)
            .with_body("Request has expired")
            .create_async()
            .await;
        let _missing_etag = server
            .mock("PUT", "/ok")
            .with_status(200)
            .create_async()
            .await;

        let file = FileDescriptor::from_bytes("a.jpg", "image/jpeg", b"xy".to_vec());
        let store = HttpBlobStore::new(Client::new());
        let (progress, _) = counting_progress();

        let err = store
            .put(BlobPut {
                url: format!("{}/expired", server.url()),
                headers: HashMap::new(),
                content_type: file.content_type.clone(),
                body: file.body(),
                progress: progress.clone(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("Request has expired"));
        assert!(!is_retryable_error(&err));

        let etag = store
            .put(BlobPut {
                url: format!("{}/ok", server.url()),
                headers: HashMap::new(),
                content_type: file.content_type.clone(),
                body: file.body(),
                progress,
            })
            .await
            .unwrap();
        assert!(etag.is_none());
    }
}
