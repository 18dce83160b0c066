//! The durable write queue.
//!
//! [`DurableQueue`] records write intents in local storage before
//! acknowledging them, drains them to a [`RemotePersistence`] one at a time,
//! retries failures with progressive backoff, and drains again whenever the
//! device comes back online.
//!
//! Only one drain pass runs at a time. A pass works on a snapshot of the
//! queue taken when it starts; items enqueued meanwhile wait for the next
//! pass. Retry timers re-run the whole queue rather than a single item, so
//! every eligible item shares the same sweep.

mod dispatcher;
mod scheduler;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connectivity::ConnectivityObserver;
use crate::error::{Error, Result};
use crate::item::{ItemId, OperationKind, QueueItem, DEFAULT_MAX_RETRIES};
use crate::remote::RemotePersistence;
use crate::storage::LocalStorage;

pub use scheduler::{RetrySchedule, RETRY_INTERVALS_MS};

use scheduler::RetryTimers;

/// Maximum number of pending items before the oldest are evicted.
pub const MAX_QUEUE_SIZE: usize = 50;

/// Storage key the serialized queue lives under.
pub const DEFAULT_STORAGE_KEY: &str = "durable_write_queue";

/// Runtime settings for a [`DurableQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum number of pending items.
    pub max_queue_size: usize,
    /// Retry budget for items enqueued without one.
    pub default_max_retries: u32,
    /// Delays between attempts.
    pub retry_schedule: RetrySchedule,
    /// Storage key for the serialized queue.
    pub storage_key: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: MAX_QUEUE_SIZE,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_schedule: RetrySchedule::default(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// Read-only snapshot of the queue for diagnostics and UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Number of pending items.
    pub item_count: usize,
    /// Whether a drain pass is running.
    pub is_processing: bool,
    /// The earliest enqueued pending item.
    pub oldest_item: Option<QueueItem>,
    /// The most recently enqueued pending item.
    pub newest_item: Option<QueueItem>,
    /// Number of retry timers waiting to fire.
    pub pending_retries: usize,
}

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Explicit,
    Enqueue,
    RetryTimer,
    ConnectivityRestored,
    ForceSync,
}

impl Trigger {
    /// Whether this trigger, arriving mid-pass, asks for one more pass once
    /// the current one ends.
    fn wants_follow_up(self) -> bool {
        matches!(self, Self::Enqueue | Self::RetryTimer | Self::ForceSync)
    }
}

/// On-disk layout of the queue.
#[derive(Debug, Default, Deserialize)]
struct PersistedQueue {
    items: Vec<QueueItem>,
    #[serde(default)]
    is_processing: bool,
}

#[derive(Debug, Serialize)]
struct PersistedQueueRef<'a> {
    items: &'a [QueueItem],
    is_processing: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueueItem>,
    is_processing: bool,
    follow_up: bool,
}

impl QueueState {
    fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    storage: Arc<dyn LocalStorage>,
    connectivity: Arc<dyn ConnectivityObserver>,
    remote: Arc<dyn RemotePersistence>,
    settings: QueueSettings,
    state: tokio::sync::Mutex<QueueState>,
    timers: RetryTimers,
    idle: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        self.timers.cancel_all();
    }
}

/// Offline-resilient queue of pending remote writes.
///
/// Cloning yields another handle to the same queue. Background work (the
/// connectivity subscription and retry timers) stops when the last handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct DurableQueue {
    shared: Arc<Shared>,
}

impl DurableQueue {
    /// Load the persisted queue and start watching connectivity.
    ///
    /// Unreadable or corrupt stored state never fails this call: it is
    /// logged and the queue starts empty. A processing flag left behind by a
    /// pass that never finished is cleared.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(
        storage: Arc<dyn LocalStorage>,
        connectivity: Arc<dyn ConnectivityObserver>,
        remote: Arc<dyn RemotePersistence>,
        settings: QueueSettings,
    ) -> Self {
        let (persisted, mut needs_rewrite) = load(storage.as_ref(), &settings.storage_key).await;

        let mut state = QueueState {
            items: persisted.items,
            ..QueueState::default()
        };
        if persisted.is_processing {
            warn!("previous drain pass did not finish; clearing stale processing flag");
            needs_rewrite = true;
        }

        let rx = connectivity.subscribe();
        let subscribed_connected = rx.borrow().is_connected;
        let queue = Self {
            shared: Arc::new(Shared {
                storage,
                connectivity,
                remote,
                settings,
                state: tokio::sync::Mutex::new(QueueState::default()),
                timers: RetryTimers::default(),
                idle: Notify::new(),
                dispatcher: Mutex::new(None),
            }),
        };

        if !queue.evict_overflow(&mut state).is_empty() {
            needs_rewrite = true;
        }
        if needs_rewrite {
            queue.persist(&state).await;
        }
        let item_count = state.items.len();
        *queue.shared.state.lock().await = state;

        let handle = dispatcher::spawn(Arc::downgrade(&queue.shared), rx, subscribed_connected);
        *queue
            .shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(item_count, "write queue initialized");
        queue
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Settings this queue was opened with.
    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.shared.settings
    }

    /// Record a write intent and return its id.
    ///
    /// The item is persisted before this returns. If the queue is full the
    /// oldest items are evicted. When the device is online a drain starts in
    /// the background; the caller is never told how the write ends, only
    /// [`Self::status`] reflects it.
    pub async fn add_to_queue(
        &self,
        operation_kind: OperationKind,
        payload: Option<Value>,
        target_entity_id: impl Into<String>,
        max_retries: Option<u32>,
    ) -> ItemId {
        let item = QueueItem::new(
            operation_kind,
            payload,
            target_entity_id,
            max_retries.unwrap_or(self.shared.settings.default_max_retries),
        );
        let id = item.id.clone();

        {
            let mut state = self.shared.state.lock().await;
            debug!(
                item_id = %id,
                operation = %operation_kind,
                entity_id = %item.target_entity_id,
                "enqueueing write"
            );
            state.items.push(item);
            self.evict_overflow(&mut state);
            self.persist(&state).await;
        }

        if self.is_online().await {
            self.spawn_drain(Trigger::Enqueue);
        }
        id
    }

    /// Remove an item and cancel its pending retry. Returns whether the item
    /// was queued.
    pub async fn remove(&self, id: &ItemId) -> bool {
        let mut state = self.shared.state.lock().await;
        self.shared.timers.cancel(id);

        let Some(position) = state.position(id) else {
            return false;
        };
        state.items.remove(position);
        self.persist(&state).await;
        true
    }

    /// Snapshot of the queue.
    pub async fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock().await;
        QueueStatus {
            item_count: state.items.len(),
            is_processing: state.is_processing,
            oldest_item: state.items.first().cloned(),
            newest_item: state.items.last().cloned(),
            pending_retries: self.shared.timers.len(),
        }
    }

    /// All pending items in queue order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.shared.state.lock().await.items.clone()
    }

    /// Empty the queue, cancel every retry timer and erase persisted state.
    ///
    /// A dispatch already in flight is allowed to finish.
    pub async fn clear(&self) {
        let mut state = self.shared.state.lock().await;
        let item_count = state.items.len();
        state.items.clear();
        state.follow_up = false;
        let cancelled = self.shared.timers.cancel_all();

        if let Err(e) = self.shared.storage.remove(&self.shared.settings.storage_key).await {
            warn!(error = %e, "failed to erase persisted queue");
        }
        info!(item_count, cancelled, "write queue cleared");
    }

    /// Run one drain pass over the current queue.
    ///
    /// Returns immediately if a pass is already running.
    pub async fn process_queue(&self) {
        self.drain(Trigger::Explicit).await;
    }

    /// Drain after the device regains network access.
    ///
    /// Does nothing if a pass is running or the queue is empty.
    pub async fn on_connectivity_restored(&self) {
        {
            let state = self.shared.state.lock().await;
            if state.is_processing || state.items.is_empty() {
                debug!(
                    is_processing = state.is_processing,
                    item_count = state.items.len(),
                    "connectivity restored; nothing to start"
                );
                return;
            }
        }
        info!("connectivity restored; draining write queue");
        self.drain(Trigger::ConnectivityRestored).await;
    }

    /// Drain now, on behalf of a user action.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoConnectivity`] if the device is offline. Dispatch
    /// failures are not reported here; they go through the retry schedule.
    pub async fn force_sync(&self) -> Result<()> {
        if !self.is_online().await {
            return Err(Error::NoConnectivity);
        }
        self.drain(Trigger::ForceSync).await;
        Ok(())
    }

    /// Wait until no drain pass is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.shared.state.lock().await.is_processing {
                return;
            }
            notified.await;
        }
    }

    async fn is_online(&self) -> bool {
        self.shared
            .connectivity
            .fetch_current_state()
            .await
            .is_connected
    }

    fn spawn_drain(&self, trigger: Trigger) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.drain(trigger).await;
        });
    }

    async fn drain(&self, trigger: Trigger) {
        {
            let mut state = self.shared.state.lock().await;
            if state.is_processing {
                if trigger.wants_follow_up() {
                    state.follow_up = true;
                }
                debug!(?trigger, "drain already in progress");
                return;
            }
            if state.items.is_empty() {
                trace!(?trigger, "nothing to drain");
                return;
            }
            state.is_processing = true;
            self.persist(&state).await;
        }
        debug!(?trigger, "drain started");

        loop {
            let snapshot = {
                let mut state = self.shared.state.lock().await;
                state.follow_up = false;
                state.items.clone()
            };

            for item in snapshot {
                self.attempt(item).await;
            }

            let mut state = self.shared.state.lock().await;
            if state.follow_up && !state.items.is_empty() {
                debug!(item_count = state.items.len(), "running follow-up pass");
                continue;
            }
            state.is_processing = false;
            state.follow_up = false;
            self.persist(&state).await;
            debug!(remaining = state.items.len(), "drain finished");
            break;
        }

        self.shared.idle.notify_waiters();
    }

    async fn attempt(&self, item: QueueItem) {
        if self.shared.state.lock().await.position(&item.id).is_none() {
            trace!(item_id = %item.id, "item removed before dispatch");
            return;
        }

        match self.shared.remote.write(&item.write_request()).await {
            Ok(()) => {
                debug!(item_id = %item.id, operation = %item.operation_kind, "write dispatched");
                self.remove(&item.id).await;
            }
            Err(e) => self.record_failure(&item.id, &e).await,
        }
    }

    async fn record_failure(&self, id: &ItemId, error: &Error) {
        let mut state = self.shared.state.lock().await;
        let Some(position) = state.position(id) else {
            return;
        };

        let item = &mut state.items[position];
        item.retry_count = item.retry_count.saturating_add(1);

        if !error.is_retryable() {
            let item = state.items.remove(position);
            self.shared.timers.cancel(id);
            warn!(
                item_id = %item.id,
                operation = %item.operation_kind,
                entity_id = %item.target_entity_id,
                error = %error,
                "write rejected permanently; dropping it"
            );
        } else if item.is_exhausted() {
            let item = state.items.remove(position);
            self.shared.timers.cancel(id);
            warn!(
                item_id = %item.id,
                operation = %item.operation_kind,
                entity_id = %item.target_entity_id,
                attempts = item.retry_count,
                error = %error,
                "retry budget exhausted; dropping write"
            );
        } else {
            let delay = self.shared.settings.retry_schedule.delay_for(item.retry_count);
            info!(
                item_id = %item.id,
                retry_count = item.retry_count,
                max_retries = item.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "dispatch failed; retry scheduled"
            );
            self.schedule_retry(id, delay);
        }

        self.persist(&state).await;
    }

    fn schedule_retry(&self, id: &ItemId, delay: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let timer_id = id.clone();

        self.shared.timers.schedule(id, delay, move |generation| async move {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.timers.forget(&timer_id, generation);
            DurableQueue::from_shared(shared)
                .drain(Trigger::RetryTimer)
                .await;
        });
    }

    /// Drop the oldest items beyond capacity, cancelling their timers.
    fn evict_overflow(&self, state: &mut QueueState) -> Vec<QueueItem> {
        let max = self.shared.settings.max_queue_size;
        if state.items.len() <= max {
            return Vec::new();
        }

        let excess = state.items.len() - max;
        let evicted: Vec<QueueItem> = state.items.drain(..excess).collect();
        for item in &evicted {
            self.shared.timers.cancel(&item.id);
        }
        warn!(
            evicted = evicted.len(),
            max_queue_size = max,
            "write queue full; evicted oldest items"
        );
        evicted
    }

    /// Write the queue to local storage. Failures are logged and the
    /// in-memory state stays authoritative.
    async fn persist(&self, state: &QueueState) {
        let snapshot = PersistedQueueRef {
            items: &state.items,
            is_processing: state.is_processing,
        };
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize write queue");
                return;
            }
        };

        if let Err(e) = self
            .shared
            .storage
            .set(&self.shared.settings.storage_key, &json)
            .await
        {
            warn!(error = %e, "failed to persist write queue; keeping in-memory state");
        }
    }
}

/// Read the persisted queue. Returns the queue and whether storage should be
/// rewritten because what was there could not be used.
async fn load(storage: &dyn LocalStorage, key: &str) -> (PersistedQueue, bool) {
    match storage.get(key).await {
        Ok(Some(text)) => match serde_json::from_str::<PersistedQueue>(&text) {
            Ok(queue) => (queue, false),
            Err(e) => {
                warn!(error = %e, "stored write queue is corrupt; starting empty");
                (PersistedQueue::default(), true)
            }
        },
        Ok(None) => (PersistedQueue::default(), false),
        Err(e) => {
            warn!(error = %e, "failed to read stored write queue; starting empty");
            (PersistedQueue::default(), false)
        }
    }
}
