use serde::{Deserialize, Serialize};

use crate::api::models::StorageInfo;
use crate::types::ByteSize;

/// Storage usage of the account before a submission started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

/// Emitted when a submission pushes usage past the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub uploaded_size_bytes: u64,
    pub limit_bytes: u64,
    pub excess_bytes: u64,
}

impl StorageQuota {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used_bytes,
            limit_bytes,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.used_bytes > self.limit_bytes
    }

    /// Usage after `transferred` more bytes landed.
    pub fn after(&self, transferred: u64) -> Self {
        Self {
            used_bytes: self.used_bytes.saturating_add(transferred),
            limit_bytes: self.limit_bytes,
        }
    }

    /// Reports a crossing only: usage at or under the limit before, over it
    /// after. An account already over its limit is not reported again.
    pub fn check(&self, transferred: u64) -> Option<QuotaCheck> {
        let total = self.used_bytes.saturating_add(transferred);
        if self.is_exceeded() || total <= self.limit_bytes {
            return None;
        }
        Some(QuotaCheck {
            uploaded_size_bytes: total,
            limit_bytes: self.limit_bytes,
            excess_bytes: total - self.limit_bytes,
        })
    }
}

impl From<&StorageInfo> for StorageQuota {
    fn from(info: &StorageInfo) -> Self {
        Self::new(info.used_bytes, info.limit_bytes)
    }
}

impl std::fmt::Display for StorageQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {}",
            ByteSize::new(self.used_bytes),
            ByteSize::new(self.limit_bytes)
        )
    }
}
