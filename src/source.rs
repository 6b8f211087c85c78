use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Where the bytes of a submitted file live. Disk sources are read lazily,
/// one range at a time, so large files are never held in memory.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// One file as handed to the pipeline by the caller.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_name: String,
    pub byte_size: u64,
    pub content_type: String,
    pub source: FileSource,
}

impl FileDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        byte_size: u64,
        source: FileSource,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            byte_size,
            content_type: content_type.into(),
            source,
        }
    }

    pub fn from_bytes(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        let bytes = bytes.into();
        Self::new(file_name, content_type, bytes.len() as u64, FileSource::Memory(bytes))
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        anyhow::ensure!(metadata.is_file(), "{} is not a regular file", path.display());

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;

        Ok(Self {
            content_type: content_type_for(path).to_string(),
            file_name,
            byte_size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn body(&self) -> BlobBody {
        self.range(0, self.byte_size)
    }

    pub fn range(&self, offset: u64, length: u64) -> BlobBody {
        BlobBody {
            source: self.source.clone(),
            offset,
            length,
        }
    }

    pub fn matches_content_type(&self, accepted: &str) -> bool {
        let accepted = accepted.trim();
        if accepted.is_empty() || accepted == "*/*" {
            return true;
        }
        let content_type = self.content_type.to_ascii_lowercase();
        match accepted.strip_suffix('*') {
            Some(prefix) => content_type.starts_with(&prefix.to_ascii_lowercase()),
            None if accepted.ends_with('/') => content_type.starts_with(&accepted.to_ascii_lowercase()),
            None => content_type == accepted.to_ascii_lowercase(),
        }
    }
}

/// A byte range of a file source, sent as one PUT body.
#[derive(Debug, Clone)]
pub struct BlobBody {
    pub source: FileSource,
    pub offset: u64,
    pub length: u64,
}

impl BlobBody {
    /// Slice of an in-memory source, `None` for disk sources.
    pub fn memory_slice(&self) -> Option<Result<Bytes>> {
        match &self.source {
            FileSource::Memory(bytes) => {
                let start = self.offset as usize;
                let end = start.saturating_add(self.length as usize);
                if end > bytes.len() {
                    return Some(Err(anyhow::anyhow!(
                        "Range {}..{} exceeds in-memory source of {} bytes",
                        start,
                        end,
                        bytes.len()
                    )));
                }
                Some(Ok(bytes.slice(start..end)))
            }
            FileSource::Path(_) => None,
        }
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        "dng" => "image/x-adobe-dng",
        "cr2" => "image/x-canon-cr2",
        "nef" => "image/x-nikon-nef",
        "arw" => "image/x-sony-arw",
        _ => OCTET_STREAM,
    }
}
