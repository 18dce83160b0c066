//! Onboarding progress, saved locally and synced through the write queue.
//!
//! [`ProgressStore`] is what the application talks to. Every save lands in
//! local storage first so the user never loses a step, then a write intent
//! is queued for the remote document named by the entity id.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::item::{ItemId, OperationKind};
use crate::queue::DurableQueue;
use crate::storage::LocalStorage;

/// Prefix of the local storage key holding an entity's snapshot.
const PROGRESS_KEY_PREFIX: &str = "onboarding_progress:";

static ENTITY_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.@-]{1,128}$").expect("Invalid entity id pattern")
});

/// A user's place in the onboarding flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingProgress {
    /// Profile fields collected so far.
    #[serde(default)]
    pub profile: Map<String, Value>,
    /// Index of the step the user is on.
    pub current_step: u32,
    /// Names of the steps already finished.
    #[serde(default)]
    pub completed_steps: Vec<String>,
}

impl OnboardingProgress {
    /// Create progress sitting at `current_step` with nothing completed.
    #[must_use]
    pub fn at_step(current_step: u32) -> Self {
        Self {
            current_step,
            ..Self::default()
        }
    }

    /// Mark `step` as completed. Completing a step twice is a no-op.
    pub fn complete(&mut self, step: impl Into<String>) {
        let step = step.into();
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
    }
}

/// Check that `entity_id` can name a remote document.
///
/// # Errors
///
/// Returns [`Error::InvalidEntityId`] if the id is empty, longer than 128
/// characters, or contains anything other than ASCII letters, digits and
/// `_ . @ -`.
pub fn validate_entity_id(entity_id: &str) -> Result<()> {
    if ENTITY_ID_PATTERN.is_match(entity_id) {
        Ok(())
    } else {
        Err(Error::InvalidEntityId(entity_id.to_string()))
    }
}

/// Local-first store for onboarding progress.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    storage: Arc<dyn LocalStorage>,
    queue: DurableQueue,
}

impl ProgressStore {
    /// Create a store that keeps snapshots in `storage` and syncs them
    /// through `queue`.
    #[must_use]
    pub fn new(storage: Arc<dyn LocalStorage>, queue: DurableQueue) -> Self {
        Self { storage, queue }
    }

    /// The queue remote writes go through.
    #[must_use]
    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    /// Save `progress` for `entity_id` and queue a remote merge-write.
    ///
    /// Returns the queued item id, or `None` when the newest queued write for
    /// the entity is already a save of this exact snapshot. Once that write
    /// has been delivered or dropped, saving the snapshot again queues it
    /// again.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity id is invalid or the snapshot cannot be
    /// written to local storage.
    pub async fn save(
        &self,
        entity_id: &str,
        progress: &OnboardingProgress,
    ) -> Result<Option<ItemId>> {
        validate_entity_id(entity_id)?;
        let payload = serde_json::to_value(progress)?;

        if self.is_pending(entity_id, &payload).await {
            debug!(entity_id, "identical progress already queued; skipping sync");
            return Ok(None);
        }

        let snapshot = serde_json::to_string(progress)?;
        self.storage.set(&progress_key(entity_id), &snapshot).await?;
        let id = self
            .queue
            .add_to_queue(OperationKind::SaveProgress, Some(payload), entity_id, None)
            .await;

        info!(
            entity_id,
            current_step = progress.current_step,
            item_id = %id,
            "progress saved"
        );
        Ok(Some(id))
    }

    /// Whether the newest queued write for `entity_id` saves `payload`.
    async fn is_pending(&self, entity_id: &str, payload: &Value) -> bool {
        self.queue
            .items()
            .await
            .iter()
            .rev()
            .find(|item| item.target_entity_id == entity_id)
            .is_some_and(|item| {
                item.operation_kind == OperationKind::SaveProgress
                    && item.payload.as_ref() == Some(payload)
            })
    }

    /// Read the locally saved progress for `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity id is invalid, storage cannot be read,
    /// or the saved snapshot is corrupt.
    pub async fn load(&self, entity_id: &str) -> Result<Option<OnboardingProgress>> {
        validate_entity_id(entity_id)?;
        match self.storage.get(&progress_key(entity_id)).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Forget the progress for `entity_id` locally and queue a remote
    /// tombstone-write.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity id is invalid or local storage fails.
    pub async fn clear(&self, entity_id: &str) -> Result<ItemId> {
        validate_entity_id(entity_id)?;
        self.storage.remove(&progress_key(entity_id)).await?;

        let id = self
            .queue
            .add_to_queue(OperationKind::ClearProgress, None, entity_id, None)
            .await;
        info!(entity_id, item_id = %id, "progress cleared");
        Ok(id)
    }
}

fn progress_key(entity_id: &str) -> String {
    format!("{PROGRESS_KEY_PREFIX}{entity_id}")
}
