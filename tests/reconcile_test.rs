//! Integration tests for orphan reconciliation against out-of-band deletions.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use triptally::feed::memory::MemoryStore;
use triptally::model::{
    ActivityCategory, ActivityRecord, ExpenseRecord, Timestamp, TripRecord, UserId,
};
use triptally::{AggregateSnapshot, EngineConfig, StatsEngine};

/// Opt-in log output: `RUST_LOG=triptally=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> EngineConfig {
    EngineConfig {
        reference_year: 2025,
        ..EngineConfig::default()
    }
}

fn trip(id: &str, name: &str) -> TripRecord {
    TripRecord {
        id: id.into(),
        name: name.to_string(),
        destination: String::new(),
        start_date: Timestamp::from_ymd(2025, 1, 1),
        end_date: Timestamp::from_ymd(2025, 1, 5),
        activities: vec![ActivityRecord {
            category: ActivityCategory::Lodging,
            checked_in: true,
            completed: false,
        }],
        collaborators: Vec::new(),
        created_at: Timestamp::from_ymd(2024, 12, 1).unwrap(),
    }
}

fn expense(id: &str, amount: f64, trip: &str) -> ExpenseRecord {
    ExpenseRecord {
        id: id.into(),
        amount,
        created_at: Timestamp::from_ymd(2025, 1, 2).unwrap(),
        trip_id: Some(trip.into()),
        description: None,
    }
}

async fn wait_for(
    stream: &mut (impl Stream<Item = AggregateSnapshot> + Unpin),
    pred: impl Fn(&AggregateSnapshot) -> bool,
) -> AggregateSnapshot {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = stream.next().await.expect("snapshot stream ended early");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for matching snapshot")
}

#[tokio::test]
async fn deleting_filtered_trip_resets_scope_to_all_trips() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let user: UserId = "u1".into();
    store.put_trip(&user, trip("T1", "Kyoto")).await;
    store.put_trip(&user, trip("T2", "Osaka")).await;
    store.put_expense(&user, expense("E1", 100.0, "T1")).await;
    store.put_expense(&user, expense("E2", 50.0, "T2")).await;

    let engine = StatsEngine::new(store.clone(), config());
    let handle = engine.start(Some(user.clone())).await;
    let mut stream = handle.snapshots();
    wait_for(&mut stream, |s| s.total_expenses == 150.0).await;

    handle.set_trip_filter(Some("T2".into())).await;
    wait_for(&mut stream, |s| s.total_expenses == 50.0).await;

    // T2 is deleted from another device; E2 still references it.
    store.remove_trip(&user, &"T2".into()).await;

    // The reconciler flags E2, clears the now-invalid filter, and forces a
    // refetch — the stream settles back on the all-trips scope.
    let repaired = wait_for(&mut stream, |s| s.total_expenses == 150.0).await;
    assert_eq!(repaired.total_plans, 1, "only T1 remains");
    handle.stop();
}

#[tokio::test]
async fn valid_filter_survives_unrelated_deletion() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let user: UserId = "u1".into();
    store.put_trip(&user, trip("T1", "Kyoto")).await;
    store.put_trip(&user, trip("T2", "Osaka")).await;
    store.put_expense(&user, expense("E1", 100.0, "T1")).await;
    store.put_expense(&user, expense("E2", 50.0, "T2")).await;

    let engine = StatsEngine::new(store.clone(), config());
    let handle = engine.start(Some(user.clone())).await;
    let mut stream = handle.snapshots();
    wait_for(&mut stream, |s| s.total_expenses == 150.0).await;

    handle.set_trip_filter(Some("T1".into())).await;
    wait_for(&mut stream, |s| s.total_expenses == 100.0).await;

    store.remove_trip(&user, &"T2".into()).await;

    // E2 is orphaned and a refetch runs, but the T1 filter is still valid —
    // the scope stays pinned and totals stay T1-only.
    let after = wait_for(&mut stream, |s| s.total_plans == 1).await;
    assert_eq!(after.total_expenses, 100.0);
    handle.stop();
}

#[tokio::test]
async fn persistent_orphan_defers_instead_of_looping() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let user: UserId = "u1".into();
    store.put_trip(&user, trip("T1", "Kyoto")).await;
    store.put_trip(&user, trip("T2", "Osaka")).await;
    store.put_expense(&user, expense("E2", 50.0, "T2")).await;

    let engine = StatsEngine::new(store.clone(), config());
    let handle = engine.start(Some(user.clone())).await;
    let mut stream = handle.snapshots();
    wait_for(&mut stream, |s| s.total_expenses == 50.0).await;

    // The orphaned expense outlives the refetch (the store really has no T2
    // anymore). The reconciler must settle, not spin.
    store.remove_trip(&user, &"T2".into()).await;
    wait_for(&mut stream, |s| s.total_plans == 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = handle.latest();
    assert_eq!(settled.total_expenses, 50.0);

    // And the next natural emission still works.
    store.put_expense(&user, expense("E3", 25.0, "T1")).await;
    wait_for(&mut stream, |s| s.total_expenses == 75.0).await;
    handle.stop();
}

#[tokio::test]
async fn legacy_tagged_expense_orphaned_by_rename() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let user: UserId = "u1".into();
    store.put_trip(&user, trip("T1", "Kyoto")).await;
    // No trip id — only the legacy embedded tag, naming a trip that is gone.
    store
        .put_expense(
            &user,
            ExpenseRecord {
                id: "E9".into(),
                amount: 30.0,
                created_at: Timestamp::from_ymd(2024, 6, 1).unwrap(),
                trip_id: None,
                description: Some("taxi [trip:Osaka]".to_string()),
            },
        )
        .await;

    let engine = StatsEngine::new(store.clone(), config());
    let handle = engine.start(Some(user.clone())).await;
    let mut stream = handle.snapshots();
    wait_for(&mut stream, |s| s.total_expenses == 30.0).await;

    // Trigger a trips-driven publish; the reconciler scans and refetches,
    // and the engine keeps serving (best-effort repair, no crash).
    store.put_trip(&user, trip("T3", "Nara")).await;
    let snapshot = wait_for(&mut stream, |s| s.total_plans == 2).await;
    assert_eq!(snapshot.total_expenses, 30.0);
    handle.stop();
}
