//! Core queue item types.
//!
//! A [`QueueItem`] is one pending write intent together with its retry
//! bookkeeping. Items are serialized as JSON when the queue is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Retry budget applied when a caller does not pass one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Unique identifier of a queued write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a fresh identifier.
    ///
    /// Random v4 UUIDs stay unique even when many items are created within
    /// the same millisecond.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// View the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The kind of write an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Merge a progress snapshot into the remote document.
    SaveProgress,
    /// Tombstone the remote progress document.
    ClearProgress,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveProgress => write!(f, "save_progress"),
            Self::ClearProgress => write!(f, "clear_progress"),
        }
    }
}

/// A single pending write intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Identifier assigned at enqueue time.
    pub id: ItemId,

    /// What the write does.
    pub operation_kind: OperationKind,

    /// Opaque snapshot to write. `None` for [`OperationKind::ClearProgress`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// The remote document this write targets, captured at enqueue time.
    pub target_entity_id: String,

    /// When the item was created.
    pub enqueued_at: DateTime<Utc>,

    /// Failed dispatch attempts so far.
    pub retry_count: u32,

    /// Number of failed attempts after which the item is dropped.
    pub max_retries: u32,
}

impl QueueItem {
    /// Create a new item with a fresh id and no failed attempts.
    #[must_use]
    pub fn new(
        operation_kind: OperationKind,
        payload: Option<Value>,
        target_entity_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: ItemId::generate(),
            operation_kind,
            payload,
            target_entity_id: target_entity_id.into(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }

    /// Whether the retry budget has been used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Build the request handed to the remote persistence service.
    #[must_use]
    pub fn write_request(&self) -> WriteRequest {
        WriteRequest {
            operation_kind: self.operation_kind,
            payload: self.payload.clone(),
            target_entity_id: self.target_entity_id.clone(),
        }
    }
}

/// What the remote persistence service receives for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// What the write does.
    pub operation_kind: OperationKind,
    /// Snapshot to merge, if any.
    pub payload: Option<Value>,
    /// The remote document to write.
    pub target_entity_id: String,
}
