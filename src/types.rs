use anyhow::Result as AnyhowResult;
use humansize::{format_size, DECIMAL};
use serde::{Deserialize, Serialize};

pub type Result<T> = AnyhowResult<T>;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_size(self.0, DECIMAL))
    }
}

/// Session-local identifier of a submitted file. Stable for the lifetime of
/// the task it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Photographer uploads into the gallery itself.
    Gallery,
    /// Final deliverables for a client order; requires the order id.
    Delivery,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Gallery => "gallery",
            UploadMode::Delivery => "delivery",
        }
    }

    pub fn requires_secondary_id(&self) -> bool {
        matches!(self, UploadMode::Delivery)
    }
}

/// Destination of an upload. Doubles as the batch key: requests for the same
/// target are coalesced into one backend call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadTarget {
    pub resource_id: String,
    pub mode: UploadMode,
    pub secondary_id: Option<String>,
}

impl UploadTarget {
    pub fn gallery(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            mode: UploadMode::Gallery,
            secondary_id: None,
        }
    }

    pub fn delivery(resource_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            mode: UploadMode::Delivery,
            secondary_id: Some(order_id.into()),
        }
    }

    pub fn has_required_secondary_id(&self) -> bool {
        !self.mode.requires_secondary_id()
            || self
                .secondary_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty())
    }
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.secondary_id.as_deref() {
            Some(secondary) => write!(f, "{}:{}/{}", self.mode.as_str(), self.resource_id, secondary),
            None => write!(f, "{}:{}", self.mode.as_str(), self.resource_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Single,
    Multipart,
}

impl TransferKind {
    pub fn for_size(byte_size: u64, multipart_threshold: u64) -> Self {
        if byte_size >= multipart_threshold {
            TransferKind::Multipart
        } else {
            TransferKind::Single
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_formatting() {
        assert_eq!(ByteSize::new(512).to_string(), "512 B");
        assert_eq!(ByteSize::new(1_500).to_string(), "1.50 kB");
        assert_eq!(ByteSize::new(1_100_000_000).to_string(), "1.10 GB");
    }

    #[test]
    fn test_transfer_kind_threshold_is_inclusive() {
        let threshold = 100 * MIB;
        assert_eq!(TransferKind::for_size(threshold - 1, threshold), TransferKind::Single);
        assert_eq!(TransferKind::for_size(threshold, threshold), TransferKind::Multipart);
        assert_eq!(TransferKind::for_size(150 * MIB, threshold), TransferKind::Multipart);
    }

    #[test]
    fn test_delivery_target_requires_order() {
        assert!(UploadTarget::gallery("g1").has_required_secondary_id());
        assert!(UploadTarget::delivery("g1", "order-9").has_required_secondary_id());

        let mut missing = UploadTarget::delivery("g1", "x");
        missing.secondary_id = None;
        assert!(!missing.has_required_secondary_id());

        missing.secondary_id = Some("  ".to_string());
        assert!(!missing.has_required_secondary_id());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(UploadTarget::gallery("g1").to_string(), "gallery:g1");
        assert_eq!(
            UploadTarget::delivery("g1", "o2").to_string(),
            "delivery:g1/o2"
        );
    }
}
