use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use super::*;
use crate::connectivity::ConnectivityHandle;
use crate::item::WriteRequest;
use crate::logging::init_test_logging;
use crate::storage::{MemoryStore, SqliteStore};

/// Remote that records every write and fails on demand.
#[derive(Debug, Default)]
struct FakeRemote {
    calls: std::sync::Mutex<Vec<(WriteRequest, Instant)>>,
    fail_all: AtomicBool,
    failing_entities: std::sync::Mutex<HashSet<String>>,
    rejected_entities: std::sync::Mutex<HashSet<String>>,
    latency: std::sync::Mutex<Duration>,
}

impl FakeRemote {
    fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn fail_entity(&self, entity: &str) {
        self.failing_entities
            .lock()
            .unwrap()
            .insert(entity.to_string());
    }

    fn reject_entity(&self, entity: &str) {
        self.rejected_entities
            .lock()
            .unwrap()
            .insert(entity.to_string());
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn entities(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(request, _)| request.target_entity_id.clone())
            .collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl RemotePersistence for FakeRemote {
    async fn write(&self, request: &WriteRequest) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), Instant::now()));

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self
            .rejected_entities
            .lock()
            .unwrap()
            .contains(&request.target_entity_id)
        {
            return Err(Error::InvalidEntityId(request.target_entity_id.clone()));
        }

        let failing = self.fail_all.load(Ordering::SeqCst)
            || self
                .failing_entities
                .lock()
                .unwrap()
                .contains(&request.target_entity_id);
        if failing {
            return Err(Error::dispatch(
                request.operation_kind.to_string(),
                &request.target_entity_id,
                "remote unavailable",
            ));
        }
        Ok(())
    }
}

/// Storage whose writes always fail.
#[derive(Debug, Default)]
struct BrokenStorage;

#[async_trait]
impl LocalStorage for BrokenStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::internal("disk full"))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::internal("disk full"))
    }
}

struct Harness {
    queue: DurableQueue,
    storage: Arc<MemoryStore>,
    remote: Arc<FakeRemote>,
    connectivity: ConnectivityHandle,
}

async fn harness(online: bool) -> Harness {
    harness_with(online, QueueSettings::default()).await
}

async fn harness_with(online: bool, settings: QueueSettings) -> Harness {
    init_test_logging();
    let storage = Arc::new(MemoryStore::new());
    let remote = Arc::new(FakeRemote::default());
    let connectivity = ConnectivityHandle::new(online);
    let queue = DurableQueue::open(
        storage.clone(),
        Arc::new(connectivity.clone()),
        remote.clone(),
        settings,
    )
    .await;

    Harness {
        queue,
        storage,
        remote,
        connectivity,
    }
}

async fn reopen(h: &Harness) -> DurableQueue {
    DurableQueue::open(
        h.storage.clone(),
        Arc::new(ConnectivityHandle::new(false)),
        h.remote.clone(),
        h.queue.settings().clone(),
    )
    .await
}

async fn save(queue: &DurableQueue, entity: &str, step: u32) -> ItemId {
    queue
        .add_to_queue(
            OperationKind::SaveProgress,
            Some(json!({ "currentStep": step })),
            entity,
            None,
        )
        .await
}

/// Let spawned drains start, then wait for them to finish.
async fn settle(queue: &DurableQueue) {
    tokio::time::sleep(Duration::from_millis(1)).await;
    queue.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn test_online_enqueue_dispatches_immediately() {
    let h = harness(true).await;

    save(&h.queue, "user-1", 3).await;
    settle(&h.queue).await;

    let status = h.queue.status().await;
    assert_eq!(status.item_count, 0);
    assert_eq!(status.pending_retries, 0);
    assert!(!status.is_processing);
    assert_eq!(h.remote.call_count(), 1);

    let calls = h.remote.calls.lock().unwrap();
    assert_eq!(calls[0].0.payload, Some(json!({"currentStep": 3})));
    assert_eq!(calls[0].0.operation_kind, OperationKind::SaveProgress);
}

#[tokio::test(start_paused = true)]
async fn test_offline_enqueue_waits_for_connectivity() {
    let h = harness(false).await;

    save(&h.queue, "user-1", 3).await;
    settle(&h.queue).await;
    assert_eq!(h.queue.status().await.item_count, 1);
    assert_eq!(h.remote.call_count(), 0);

    let err = h.queue.force_sync().await.unwrap_err();
    assert!(err.is_no_connectivity());
    assert_eq!(h.remote.call_count(), 0);

    h.connectivity.set_connected(true);
    settle(&h.queue).await;

    assert_eq!(h.queue.status().await.item_count, 0);
    assert_eq!(h.remote.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear_cancels_pending_retries() {
    let h = harness(false).await;
    h.remote.fail_entity("flaky-1");
    h.remote.fail_entity("flaky-2");

    save(&h.queue, "flaky-1", 1).await;
    save(&h.queue, "flaky-2", 1).await;
    h.queue.process_queue().await;
    for n in 0..3 {
        save(&h.queue, &format!("user-{n}"), 1).await;
    }

    let status = h.queue.status().await;
    assert_eq!(status.item_count, 5);
    assert_eq!(status.pending_retries, 2);
    assert_eq!(h.remote.call_count(), 2);

    h.queue.clear().await;
    let status = h.queue.status().await;
    assert_eq!(status.item_count, 0);
    assert_eq!(status.pending_retries, 0);
    assert!(h.storage.is_empty());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.remote.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_enqueued_items_survive_restart() {
    let h = harness(false).await;

    let mut ids = Vec::new();
    for step in 0..7 {
        ids.push(save(&h.queue, "user-1", step).await);
    }
    let Harness {
        queue,
        storage,
        remote,
        ..
    } = h;
    let settings = queue.settings().clone();
    drop(queue);

    let restarted = DurableQueue::open(
        storage,
        Arc::new(ConnectivityHandle::new(false)),
        remote,
        settings,
    )
    .await;

    assert_eq!(restarted.status().await.item_count, 7);
    let restored: Vec<ItemId> = restarted.items().await.into_iter().map(|i| i.id).collect();
    assert_eq!(restored, ids);
}

#[tokio::test]
async fn test_enqueued_items_survive_restart_on_sqlite() {
    let db_path = std::env::temp_dir().join(format!(
        "syncqueue_restart_{}.db",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&db_path);
    let remote = Arc::new(FakeRemote::default());

    {
        let storage = Arc::new(SqliteStore::open(&db_path).unwrap());
        let queue = DurableQueue::open(
            storage,
            Arc::new(ConnectivityHandle::new(false)),
            remote.clone(),
            QueueSettings::default(),
        )
        .await;
        save(&queue, "user-1", 1).await;
        queue
            .add_to_queue(OperationKind::ClearProgress, None, "user-1", Some(2))
            .await;
    }

    let storage = Arc::new(SqliteStore::open(&db_path).unwrap());
    let queue = DurableQueue::open(
        storage,
        Arc::new(ConnectivityHandle::new(false)),
        remote,
        QueueSettings::default(),
    )
    .await;

    let items = queue.items().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].operation_kind, OperationKind::ClearProgress);
    assert_eq!(items[1].max_retries, 2);
    assert!(items[1].payload.is_none());

    drop(queue);
    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
}

#[tokio::test(start_paused = true)]
async fn test_overflow_evicts_oldest() {
    let h = harness(false).await;

    for step in 0..60 {
        save(&h.queue, "user-1", step).await;
    }

    let items = h.queue.items().await;
    assert_eq!(items.len(), 50);
    let steps: Vec<u64> = items
        .iter()
        .map(|i| i.payload.as_ref().unwrap()["currentStep"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, (10..60).collect::<Vec<u64>>());

    let status = h.queue.status().await;
    assert_eq!(status.oldest_item.unwrap().payload, Some(json!({"currentStep": 10})));
    assert_eq!(status.newest_item.unwrap().payload, Some(json!({"currentStep": 59})));

    assert_eq!(reopen(&h).await.status().await.item_count, 50);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_cancels_retry_of_evicted_item() {
    let settings = QueueSettings {
        max_queue_size: 2,
        ..QueueSettings::default()
    };
    let h = harness_with(false, settings).await;
    h.remote.fail_entity("flaky");

    save(&h.queue, "flaky", 1).await;
    h.queue.process_queue().await;
    assert_eq!(h.queue.status().await.pending_retries, 1);

    save(&h.queue, "user-1", 1).await;
    save(&h.queue, "user-2", 1).await;

    let status = h.queue.status().await;
    assert_eq!(status.item_count, 2);
    assert_eq!(status.pending_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_item_is_dropped_after_max_retries() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    let id = save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;
    assert_eq!(h.queue.items().await[0].retry_count, 1);

    tokio::time::sleep(Duration::from_secs(120)).await;

    let status = h.queue.status().await;
    assert_eq!(h.remote.call_count(), 5);
    assert_eq!(status.item_count, 0);
    assert_eq!(status.pending_retries, 0);
    assert!(!h.queue.remove(&id).await);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.remote.call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_rejection_is_not_retried() {
    let h = harness(false).await;
    h.remote.reject_entity("bad-entity");

    save(&h.queue, "bad-entity", 1).await;
    save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;

    let status = h.queue.status().await;
    assert_eq!(status.item_count, 0);
    assert_eq!(status.pending_retries, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.remote.entities(), vec!["bad-entity", "user-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_budget() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    h.queue
        .add_to_queue(OperationKind::ClearProgress, None, "user-1", Some(2))
        .await;
    h.queue.process_queue().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.remote.call_count(), 2);
    assert_eq!(h.queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_follow_backoff_schedule() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    h.queue
        .add_to_queue(
            OperationKind::SaveProgress,
            Some(json!({"currentStep": 1})),
            "user-1",
            Some(8),
        )
        .await;
    h.queue.process_queue().await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    let times = h.remote.call_times();
    assert_eq!(times.len(), 8);
    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![1, 2, 5, 10, 30, 30, 30]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_transient_failure() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;
    assert_eq!(h.queue.status().await.pending_retries, 1);

    h.remote.fail_all(false);
    tokio::time::sleep(Duration::from_millis(1001)).await;
    h.queue.wait_idle().await;

    let status = h.queue.status().await;
    assert_eq!(status.item_count, 0);
    assert_eq!(status.pending_retries, 0);
    assert_eq!(h.remote.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_process_calls_run_one_pass() {
    let h = harness(false).await;
    h.remote.set_latency(Duration::from_millis(100));

    save(&h.queue, "user-1", 1).await;
    tokio::join!(h.queue.process_queue(), h.queue.process_queue());

    assert_eq!(h.remote.call_count(), 1);
    assert_eq!(h.queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_processing_during_pass() {
    let h = harness(false).await;
    h.remote.set_latency(Duration::from_millis(100));
    save(&h.queue, "user-1", 1).await;

    let queue = h.queue.clone();
    let pass = tokio::spawn(async move { queue.process_queue().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(h.queue.status().await.is_processing);
    pass.await.unwrap();
    assert!(!h.queue.status().await.is_processing);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_restored_drains_all_items() {
    let h = harness(false).await;

    for entity in ["a", "b", "c"] {
        save(&h.queue, entity, 1).await;
    }
    settle(&h.queue).await;
    assert_eq!(h.remote.call_count(), 0);

    h.connectivity.set_connected(true);
    settle(&h.queue).await;

    assert_eq!(h.remote.entities(), vec!["a", "b", "c"]);
    assert_eq!(h.queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_going_offline_does_not_drain() {
    let h = harness(true).await;
    h.connectivity.set_connected(false);
    save(&h.queue, "user-1", 1).await;

    settle(&h.queue).await;
    assert_eq!(h.remote.call_count(), 0);
    assert_eq!(h.queue.status().await.item_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_items_added_mid_pass_run_in_follow_up_pass() {
    let h = harness(true).await;
    h.remote.set_latency(Duration::from_millis(100));

    save(&h.queue, "first", 1).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.queue.status().await.is_processing);

    save(&h.queue, "second", 1).await;
    settle(&h.queue).await;

    assert_eq!(h.remote.entities(), vec!["first", "second"]);
    assert_eq!(h.queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_does_not_block_later_items() {
    let h = harness(false).await;
    h.remote.fail_entity("flaky");

    save(&h.queue, "flaky", 1).await;
    save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;

    let items = h.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].target_entity_id, "flaky");
    assert_eq!(h.remote.entities(), vec!["flaky", "user-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_cancels_retry() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    let id = save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;
    assert_eq!(h.queue.status().await.pending_retries, 1);

    assert!(h.queue.remove(&id).await);
    assert_eq!(h.queue.status().await.pending_retries, 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.remote.call_count(), 1);
    assert_eq!(reopen(&h).await.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_online_drains() {
    let h = harness(false).await;
    save(&h.queue, "user-1", 1).await;

    h.connectivity.set_connected(true);
    h.queue.force_sync().await.unwrap();
    h.queue.wait_idle().await;

    assert_eq!(h.queue.status().await.item_count, 0);
    assert_eq!(h.remote.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_on_empty_queue() {
    let h = harness(true).await;
    assert!(h.queue.force_sync().await.is_ok());
    assert_eq!(h.remote.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_entity_captured_at_enqueue() {
    let h = harness(false).await;
    h.queue
        .add_to_queue(OperationKind::ClearProgress, None, "user-99", None)
        .await;
    h.queue.process_queue().await;

    let calls = h.remote.calls.lock().unwrap();
    assert_eq!(calls[0].0.target_entity_id, "user-99");
    assert_eq!(calls[0].0.operation_kind, OperationKind::ClearProgress);
    assert!(calls[0].0.payload.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_storage_starts_empty() {
    init_test_logging();
    let storage = Arc::new(MemoryStore::new());
    storage.set(DEFAULT_STORAGE_KEY, "{not json").await.unwrap();

    let queue = DurableQueue::open(
        storage.clone(),
        Arc::new(ConnectivityHandle::new(false)),
        Arc::new(FakeRemote::default()),
        QueueSettings::default(),
    )
    .await;

    assert_eq!(queue.status().await.item_count, 0);
    let stored = storage.get(DEFAULT_STORAGE_KEY).await.unwrap().unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&stored).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_stale_processing_flag_is_cleared() {
    init_test_logging();
    let storage = Arc::new(MemoryStore::new());
    let item = QueueItem::new(OperationKind::SaveProgress, Some(json!({})), "user-1", 5);
    let stored = json!({ "items": [item], "is_processing": true });
    storage
        .set(DEFAULT_STORAGE_KEY, &stored.to_string())
        .await
        .unwrap();
    let remote = Arc::new(FakeRemote::default());

    let queue = DurableQueue::open(
        storage,
        Arc::new(ConnectivityHandle::new(false)),
        remote.clone(),
        QueueSettings::default(),
    )
    .await;

    let status = queue.status().await;
    assert!(!status.is_processing);
    assert_eq!(status.item_count, 1);

    queue.process_queue().await;
    assert_eq!(remote.call_count(), 1);
    assert_eq!(queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_storage_failure_keeps_memory_state() {
    init_test_logging();
    let remote = Arc::new(FakeRemote::default());
    let queue = DurableQueue::open(
        Arc::new(BrokenStorage),
        Arc::new(ConnectivityHandle::new(false)),
        remote.clone(),
        QueueSettings::default(),
    )
    .await;

    save(&queue, "user-1", 1).await;
    assert_eq!(queue.status().await.item_count, 1);

    queue.clear().await;
    assert_eq!(queue.status().await.item_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_counts_are_persisted() {
    let h = harness(false).await;
    h.remote.fail_all(true);

    save(&h.queue, "user-1", 1).await;
    h.queue.process_queue().await;

    let restarted = reopen(&h).await;
    assert_eq!(restarted.items().await[0].retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_stops_connectivity_subscription() {
    let h = harness(false).await;
    assert_eq!(h.connectivity.subscriber_count(), 1);

    let connectivity = h.connectivity.clone();
    drop(h);
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(connectivity.subscriber_count(), 0);
}
