use serde::{Deserialize, Serialize};

pub mod upload {
    use super::*;
    use std::collections::HashMap;

    /// One file in a batched parameter request. `key` is the client-side
    /// correlation key echoed back by the backend.
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct FileSpec {
        pub key: String,
        pub content_type: String,
        pub size: u64,
    }

    #[derive(Debug, Serialize)]
    pub struct PresignRequest<'a> {
        pub files: &'a [FileSpec],
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct PresignedUrl {
        pub key: String,
        pub url: String,
        pub object_key: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        pub headers: HashMap<String, String>,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Default)]
    pub struct PresignResponse {
        #[serde(default)]
        pub urls: Vec<PresignedUrl>,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct PartUrl {
        pub part_number: u32,
        pub url: String,
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct MultipartUpload {
        pub upload_id: String,
        pub object_key: String,
        pub key: String,
        pub parts: Vec<PartUrl>,
        pub total_parts: u32,
        pub part_size: u64,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Default)]
    pub struct CreateMultipartResponse {
        #[serde(default)]
        pub uploads: Vec<MultipartUpload>,
    }

    /// Identifies an open multipart upload; `key` is the remote object key.
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct MultipartRef {
        pub upload_id: String,
        pub key: String,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct UploadedPart {
        pub part_number: u32,
        pub etag: String,
        #[serde(default)]
        pub size: u64,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Default)]
    pub struct ListPartsResponse {
        #[serde(default)]
        pub parts: Vec<UploadedPart>,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct CompletedPart {
        pub part_number: u32,
        pub etag: String,
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct CompleteMultipartRequest {
        pub upload_id: String,
        pub key: String,
        pub parts: Vec<CompletedPart>,
        pub file_size: u64,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct CompleteMultipartResponse {
        #[serde(default)]
        pub location: Option<String>,
        #[serde(default)]
        pub etag: Option<String>,
        #[serde(default)]
        pub metadata_written: bool,
    }
}

pub mod listing {
    use super::*;

    /// One entry of the backend's processed-image view.
    #[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct ListedItem {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub thumb_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub preview_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub final_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
    }

    impl ListedItem {
        pub fn processed(key: impl Into<String>) -> Self {
            let key = key.into();
            Self {
                thumb_url: Some(format!("https://cdn.example.com/thumbs/{key}")),
                key: Some(key),
                ..Default::default()
            }
        }

        pub fn pending(key: impl Into<String>) -> Self {
            Self {
                key: Some(key.into()),
                ..Default::default()
            }
        }

        /// The object key when present, otherwise the bare file name.
        pub fn identifier(&self) -> Option<&str> {
            self.key
                .as_deref()
                .or(self.filename.as_deref())
                .filter(|id| !id.is_empty())
        }

        /// Derived assets exist once any URL-bearing field is populated.
        pub fn is_processed(&self) -> bool {
            [
                &self.thumb_url,
                &self.preview_url,
                &self.final_url,
                &self.url,
            ]
            .iter()
            .any(|field| field.as_deref().is_some_and(|url| !url.trim().is_empty()))
        }
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Default)]
    pub struct ListingResponse {
        #[serde(default)]
        pub items: Vec<ListedItem>,
    }
}

pub mod session {
    use super::*;

    #[derive(Debug, Deserialize, Clone)]
    pub struct SessionInfo {
        pub user: UserInfo,
        #[serde(default)]
        pub expires_at: Option<String>,
        #[serde(default)]
        pub storage: Option<StorageInfo>,
    }

    #[derive(Debug, Deserialize, Clone)]
    pub struct UserInfo {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub email: Option<String>,
    }

    #[derive(Debug, Deserialize, Clone, Copy)]
    pub struct StorageInfo {
        pub used_bytes: u64,
        pub limit_bytes: u64,
    }
}

pub use listing::*;
pub use session::*;
pub use upload::*;
