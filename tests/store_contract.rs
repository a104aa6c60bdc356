//! Cross-backend contract tests for the coordination store.
//!
//! Every scenario runs against both backends, in-memory libSQL and the
//! lock-guarded JSON document, and must observe identical behavior.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;

use taskhive::config::CoordConfig;
use taskhive::error::StoreError;
use taskhive::registry::{EventKind, NewWorker, WorkerStatus};
use taskhive::store::{CoordStore, JsonStore, LibSqlStore};
use taskhive::task::TaskStatus;

/// Maximum time any test may run before it counts as hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config(dir: &TempDir) -> CoordConfig {
    CoordConfig {
        data_dir: dir.path().to_path_buf(),
        output_dir: dir.path().join("outputs"),
        slot_count: 2,
        max_task_retries: 2,
        ..CoordConfig::default()
    }
}

/// Both backends under the same configuration.
async fn both_stores(
    config: &CoordConfig,
    dir: &TempDir,
) -> Vec<(&'static str, Arc<dyn CoordStore>)> {
    let sqlite = LibSqlStore::new_memory(config).await.unwrap();
    let json = JsonStore::open(&dir.path().join("coord.json"), config)
        .await
        .unwrap();
    vec![
        ("libsql", Arc::new(sqlite) as Arc<dyn CoordStore>),
        ("json", Arc::new(json) as Arc<dyn CoordStore>),
    ]
}

/// Register `n` leaf workers and return their registry ids.
async fn register_workers(store: &Arc<dyn CoordStore>, n: u32) -> Vec<i64> {
    let mut ids = Vec::with_capacity(n as usize);
    for i in 1..=n {
        let id = store
            .register_worker(&NewWorker {
                folder_name: format!("agent-WKR2-0-{i}-{i:05}"),
                folder_path: format!("/tmp/hive/agent-WKR2-0-{i}-{i:05}"),
                role: "WKR2".to_string(),
                layer: 1,
                parent_id: None,
            })
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

// ── Claim semantics ──────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        for (label, store) in both_stores(&config, &dir).await {
            let workers = register_workers(&store, 4).await;
            for i in 0..12 {
                store.create_task("WKR2", &json!({ "n": i })).await.unwrap();
            }

            let mut handles = Vec::new();
            for &worker_id in &workers {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(task) =
                        store.claim_next(worker_id, Some("WKR2")).await.unwrap()
                    {
                        claimed.push(task.id);
                        store.complete_task(task.id, None).await.unwrap();
                    }
                    claimed
                }));
            }

            let mut all: Vec<i64> = Vec::new();
            for result in join_all(handles).await {
                all.extend(result.unwrap());
            }
            let distinct: HashSet<i64> = all.iter().copied().collect();
            assert_eq!(all.len(), 12, "[{label}] every task claimed once");
            assert_eq!(distinct.len(), 12, "[{label}] no task claimed twice");

            let counts = store.queue_counts(Some("WKR2")).await.unwrap();
            assert_eq!(counts.done, 12, "[{label}]");
            assert_eq!(counts.unassigned, 0, "[{label}]");
            assert_eq!(counts.processing, 0, "[{label}]");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fifo_order_and_partition_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        let worker = register_workers(&store, 1).await[0];
        let first = store.create_task("WKR2", &json!({ "n": 1 })).await.unwrap();
        let other = store
            .create_task("special", &json!({ "n": 2 }))
            .await
            .unwrap();
        let second = store.create_task("WKR2", &json!({ "n": 3 })).await.unwrap();

        // The partition filter skips the foreign task even though its id
        // is lower than the second claim's.
        let t1 = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
        let t2 = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
        assert_eq!((t1.id, t2.id), (first, second), "[{label}]");
        assert_eq!(t1.assigned_worker, Some(worker), "[{label}]");
        assert!(
            store.claim_next(worker, Some("WKR2")).await.unwrap().is_none(),
            "[{label}] drained partition yields None"
        );

        // An unfiltered claim picks up the remaining partition.
        let t3 = store.claim_next(worker, None).await.unwrap().unwrap();
        assert_eq!(t3.id, other, "[{label}]");
        assert_eq!(t3.layer, "special", "[{label}]");
    }
}

// ── Ownership & crash recovery ───────────────────────────────────────

#[tokio::test]
async fn released_claims_survive_worker_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        let workers = register_workers(&store, 2).await;
        let (crashed, survivor) = (workers[0], workers[1]);
        let t1 = store.create_task("WKR2", &json!({ "n": 1 })).await.unwrap();
        let t2 = store.create_task("WKR2", &json!({ "n": 2 })).await.unwrap();

        store.claim_next(crashed, Some("WKR2")).await.unwrap().unwrap();
        store.claim_next(crashed, Some("WKR2")).await.unwrap().unwrap();

        // Orphaned claims never expire on their own.
        assert!(
            store.claim_next(survivor, Some("WKR2")).await.unwrap().is_none(),
            "[{label}] held tasks are not claimable"
        );

        let released = store.release_all_for_worker(crashed).await.unwrap();
        assert_eq!(released, 2, "[{label}]");
        let task = store.get_task(t1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unassigned, "[{label}]");
        assert_eq!(task.assigned_worker, None, "[{label}]");

        // The survivor drains them lowest-id first.
        let r1 = store.claim_next(survivor, Some("WKR2")).await.unwrap().unwrap();
        let r2 = store.claim_next(survivor, Some("WKR2")).await.unwrap().unwrap();
        assert_eq!((r1.id, r2.id), (t1, t2), "[{label}]");
        assert_eq!(r1.assigned_worker, Some(survivor), "[{label}]");

        // A second sweep has nothing left to requeue.
        assert_eq!(
            store.release_all_for_worker(crashed).await.unwrap(),
            0,
            "[{label}]"
        );
    }
}

#[tokio::test]
async fn release_is_ownership_checked() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        let workers = register_workers(&store, 2).await;
        let (holder, intruder) = (workers[0], workers[1]);
        let id = store.create_task("WKR2", &json!({ "n": 1 })).await.unwrap();
        store.claim_next(holder, Some("WKR2")).await.unwrap().unwrap();

        let err = store.release_task(id, intruder).await.unwrap_err();
        assert!(
            matches!(err, StoreError::NotOwner { holder: Some(h), .. } if h == holder),
            "[{label}] got {err:?}"
        );
        // The failed release changed nothing.
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing, "[{label}]");
        assert_eq!(task.assigned_worker, Some(holder), "[{label}]");

        store.release_task(id, holder).await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unassigned, "[{label}]");
    }
}

#[tokio::test]
async fn retries_exhaust_into_permanent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir); // max_task_retries = 2
    for (label, store) in both_stores(&config, &dir).await {
        let worker = register_workers(&store, 1).await[0];
        let id = store.create_task("WKR2", &json!({ "n": 1 })).await.unwrap();

        for attempt in 1..=2u32 {
            store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
            store
                .save_pipeline_state(id, Some(r#"{"current_stage":2}"#))
                .await
                .unwrap();
            let status = store
                .fail_task(id, &format!("failure {attempt}"))
                .await
                .unwrap();
            assert_eq!(status, TaskStatus::Unassigned, "[{label}] attempt {attempt}");
            let task = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.retries, attempt, "[{label}]");
            // Requeue wipes the stale pipeline position.
            assert_eq!(task.pipeline_state, None, "[{label}]");
            assert_eq!(task.assigned_worker, None, "[{label}]");
        }

        // Third failure exceeds the limit and sticks.
        store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
        store
            .save_pipeline_state(id, Some(r#"{"current_stage":4}"#))
            .await
            .unwrap();
        let status = store.fail_task(id, "final failure").await.unwrap();
        assert_eq!(status, TaskStatus::Failed, "[{label}]");
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.retries, 3, "[{label}]");
        assert_eq!(task.error.as_deref(), Some("final failure"), "[{label}]");
        // Terminal failure keeps the last pipeline position for post-mortems.
        assert!(task.pipeline_state.is_some(), "[{label}]");
        assert!(
            store.claim_next(worker, Some("WKR2")).await.unwrap().is_none(),
            "[{label}] failed tasks are not requeued"
        );
    }
}

// ── Slots ────────────────────────────────────────────────────────────

#[tokio::test]
async fn slot_pool_recycles_lowest_slot_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir); // slot_count = 2
    for (label, store) in both_stores(&config, &dir).await {
        let workers = register_workers(&store, 3).await;

        let s1 = store.assign_slot(workers[0]).await.unwrap();
        let s2 = store.assign_slot(workers[1]).await.unwrap();
        assert_eq!((s1, s2), (Some(1), Some(2)), "[{label}]");
        assert_eq!(
            store.assign_slot(workers[2]).await.unwrap(),
            None,
            "[{label}] exhausted pool is not an error"
        );

        store.release_slot(1).await.unwrap();
        assert_eq!(
            store.assign_slot(workers[2]).await.unwrap(),
            Some(1),
            "[{label}] freed slot is reused"
        );

        let slots = store.list_slots().await.unwrap();
        assert_eq!(slots.len(), 2, "[{label}]");
        assert_eq!(slots[0].worker_id, Some(workers[2]), "[{label}]");
        assert_eq!(slots[1].worker_id, Some(workers[1]), "[{label}]");
    }
}

// ── Registry, events, metadata ───────────────────────────────────────

#[tokio::test]
async fn heartbeats_and_stale_detection() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        let workers = register_workers(&store, 2).await;

        assert!(
            store
                .stale_workers(Duration::from_secs(3600))
                .await
                .unwrap()
                .is_empty(),
            "[{label}] freshly registered workers are not stale"
        );
        // With a zero threshold every non-terminal worker is overdue.
        let stale = store.stale_workers(Duration::ZERO).await.unwrap();
        assert_eq!(stale.len(), 2, "[{label}]");

        let before = store.get_worker(workers[0]).await.unwrap().unwrap();
        store.record_heartbeat(workers[0]).await.unwrap();
        let after = store.get_worker(workers[0]).await.unwrap().unwrap();
        assert!(
            after.last_heartbeat >= before.last_heartbeat,
            "[{label}] heartbeat moves the timestamp forward"
        );

        // Terminal workers drop out of staleness sweeps.
        store
            .update_worker_status(workers[1], WorkerStatus::Shutdown, None)
            .await
            .unwrap();
        let stale = store.stale_workers(Duration::ZERO).await.unwrap();
        assert_eq!(stale.len(), 1, "[{label}]");
        assert_eq!(stale[0].id, workers[0], "[{label}]");
    }
}

#[tokio::test]
async fn events_are_filtered_and_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        let workers = register_workers(&store, 2).await;
        let id = store.create_task("WKR2", &json!({ "n": 1 })).await.unwrap();
        store.claim_next(workers[0], Some("WKR2")).await.unwrap().unwrap();
        store.complete_task(id, Some("/out/task_00001")).await.unwrap();
        store
            .append_event(EventKind::WorkerHeartbeat, Some(workers[1]), None, None)
            .await
            .unwrap();

        let events = store.recent_events(10, Some(workers[0])).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TaskDone,
                EventKind::TaskClaimed,
                EventKind::WorkerSpawned
            ],
            "[{label}] newest first, other workers filtered out"
        );
        assert_eq!(events[0].task_id, Some(id), "[{label}]");
        assert_eq!(
            events[0].detail.as_deref(),
            Some("/out/task_00001"),
            "[{label}]"
        );

        let limited = store.recent_events(2, None).await.unwrap();
        assert_eq!(limited.len(), 2, "[{label}] limit respected");
        assert_eq!(limited[0].kind, EventKind::WorkerHeartbeat, "[{label}]");
    }
}

#[tokio::test]
async fn meta_round_trip_and_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    for (label, store) in both_stores(&config, &dir).await {
        assert_eq!(store.get_meta("project").await.unwrap(), None, "[{label}]");
        store.set_meta("project", r#"{"name":"alpha"}"#).await.unwrap();
        assert_eq!(
            store.get_meta("project").await.unwrap().as_deref(),
            Some(r#"{"name":"alpha"}"#),
            "[{label}]"
        );
        store.set_meta("project", r#"{"name":"beta"}"#).await.unwrap();
        assert_eq!(
            store.get_meta("project").await.unwrap().as_deref(),
            Some(r#"{"name":"beta"}"#),
            "[{label}] upsert overwrites"
        );
    }
}
