//! Retry backoff schedule and per-item retry timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use crate::item::ItemId;

/// Default retry delays in milliseconds. The last one repeats.
pub const RETRY_INTERVALS_MS: [u64; 5] = [1000, 2000, 5000, 10000, 30000];

/// Progressive backoff between dispatch attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl RetrySchedule {
    /// Create a schedule from explicit delays.
    ///
    /// An empty list falls back to the default delays.
    #[must_use]
    pub fn new(intervals: Vec<Duration>) -> Self {
        if intervals.is_empty() {
            Self::default()
        } else {
            Self { intervals }
        }
    }

    /// Delay before the next attempt of an item that has failed
    /// `retry_count` times.
    ///
    /// The first failure waits the first interval; once the list is
    /// exhausted the last interval is held.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let last = self.intervals.len() - 1;
        let index = usize::try_from(retry_count.saturating_sub(1)).map_or(last, |i| i.min(last));
        self.intervals[index]
    }

    /// The delays in milliseconds.
    #[must_use]
    pub fn intervals_ms(&self) -> Vec<u64> {
        self.intervals
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .collect()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            intervals: RETRY_INTERVALS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// Pending retry timers keyed by item id.
///
/// Each entry carries a generation number so a timer that fires can remove
/// its own entry without clobbering a newer timer for the same item.
#[derive(Debug, Default)]
pub(crate) struct RetryTimers {
    inner: Mutex<TimerTable>,
}

#[derive(Debug, Default)]
struct TimerTable {
    next_generation: u64,
    handles: HashMap<ItemId, (u64, AbortHandle)>,
}

impl RetryTimers {
    /// Spawn `task` after `delay`, replacing any pending timer for `id`.
    ///
    /// `task` receives the timer generation so it can call [`Self::forget`].
    pub(crate) fn schedule<F, Fut>(&self, id: &ItemId, delay: Duration, task: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.table();
        table.next_generation += 1;
        let generation = table.next_generation;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task(generation).await;
        });

        if let Some((_, previous)) = table
            .handles
            .insert(id.clone(), (generation, handle.abort_handle()))
        {
            previous.abort();
        }
        debug!(item_id = %id, delay_ms = delay.as_millis(), "retry timer scheduled");
    }

    /// Drop the entry for `id` if it still belongs to `generation`.
    pub(crate) fn forget(&self, id: &ItemId, generation: u64) {
        let mut table = self.table();
        if table
            .handles
            .get(id)
            .is_some_and(|(current, _)| *current == generation)
        {
            table.handles.remove(id);
        }
    }

    /// Cancel the pending timer for `id`. Returns whether one existed.
    pub(crate) fn cancel(&self, id: &ItemId) -> bool {
        match self.table().handles.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(item_id = %id, "retry timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Returns how many were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut table = self.table();
        let count = table.handles.len();
        for (_, (_, handle)) in table.handles.drain() {
            handle.abort();
        }
        count
    }

    /// Number of pending timers.
    pub(crate) fn len(&self) -> usize {
        self.table().handles.len()
    }

    /// Whether a timer is pending for `id`.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ItemId) -> bool {
        self.table().handles.contains_key(id)
    }

    // The table holds no invariants a panic could break, so poisoning is ignored.
    fn table(&self) -> MutexGuard<'_, TimerTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
