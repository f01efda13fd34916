// SPDX-License-Identifier: MIT
//! In-process [`RecordStore`] backed by per-user maps.
//!
//! Every mutation re-broadcasts the full collection to all live subscribers,
//! matching the always-total feed contract. This is the crate's only concrete
//! store — real backends live with the embedder — and it doubles as the test
//! harness for the engine, including out-of-band deletions and injected
//! transport failures.

use super::{FeedError, FeedEvent, FeedKind, RecordStore};
use crate::model::{ExpenseId, ExpenseRecord, TripId, TripRecord, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Default)]
struct UserCollections {
    trips: Vec<TripRecord>,
    expenses: Vec<ExpenseRecord>,
    trip_subscribers: Vec<mpsc::Sender<FeedEvent<TripRecord>>>,
    expense_subscribers: Vec<mpsc::Sender<FeedEvent<ExpenseRecord>>>,
}

/// In-memory store. Cheaply cloneable is not needed — wrap in `Arc` to share.
pub struct MemoryStore {
    inner: RwLock<HashMap<UserId, UserCollections>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(mut capacity: usize) -> Self {
        if capacity == 0 {
            warn!("feed capacity 0 is invalid, using default");
            capacity = DEFAULT_FEED_CAPACITY;
        }
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert or replace a trip. An empty id is minted a fresh UUID.
    /// Returns the effective id.
    pub async fn put_trip(&self, user: &UserId, mut trip: TripRecord) -> TripId {
        if trip.id.as_str().is_empty() {
            trip.id = TripId(Uuid::new_v4().to_string());
        }
        let id = trip.id.clone();
        let mut inner = self.inner.write().await;
        let user_data = inner.entry(user.clone()).or_default();
        match user_data.trips.iter_mut().find(|t| t.id == trip.id) {
            Some(existing) => *existing = trip,
            None => user_data.trips.push(trip),
        }
        broadcast(&mut user_data.trip_subscribers, &user_data.trips);
        id
    }

    /// Delete a trip without touching expenses that reference it — the
    /// out-of-band deletion the reconciler exists to repair.
    pub async fn remove_trip(&self, user: &UserId, id: &TripId) {
        let mut inner = self.inner.write().await;
        let Some(user_data) = inner.get_mut(user) else {
            return;
        };
        user_data.trips.retain(|t| &t.id != id);
        broadcast(&mut user_data.trip_subscribers, &user_data.trips);
    }

    /// Insert or replace an expense. An empty id is minted a fresh UUID.
    pub async fn put_expense(&self, user: &UserId, mut expense: ExpenseRecord) -> ExpenseId {
        if expense.id.as_str().is_empty() {
            expense.id = ExpenseId(Uuid::new_v4().to_string());
        }
        let id = expense.id.clone();
        let mut inner = self.inner.write().await;
        let user_data = inner.entry(user.clone()).or_default();
        match user_data.expenses.iter_mut().find(|e| e.id == expense.id) {
            Some(existing) => *existing = expense,
            None => user_data.expenses.push(expense),
        }
        broadcast(&mut user_data.expense_subscribers, &user_data.expenses);
        id
    }

    pub async fn remove_expense(&self, user: &UserId, id: &ExpenseId) {
        let mut inner = self.inner.write().await;
        let Some(user_data) = inner.get_mut(user) else {
            return;
        };
        user_data.expenses.retain(|e| &e.id != id);
        broadcast(&mut user_data.expense_subscribers, &user_data.expenses);
    }

    /// Deliver a terminal transport error on one feed and drop its
    /// subscribers. Test hook for the degraded-mode path.
    pub async fn fail_feed(&self, user: &UserId, kind: FeedKind) {
        let mut inner = self.inner.write().await;
        let Some(user_data) = inner.get_mut(user) else {
            return;
        };
        let message = "simulated transport failure".to_string();
        match kind {
            FeedKind::Trips => {
                for tx in user_data.trip_subscribers.drain(..) {
                    let _ = tx.try_send(FeedEvent::Error(FeedError::Transport {
                        message: message.clone(),
                    }));
                }
            }
            FeedKind::Expenses => {
                for tx in user_data.expense_subscribers.drain(..) {
                    let _ = tx.try_send(FeedEvent::Error(FeedError::Transport {
                        message: message.clone(),
                    }));
                }
            }
        }
    }
}

/// Push the current snapshot to every live subscriber, pruning closed ones.
/// A subscriber whose channel is full misses this emission — the next
/// mutation re-broadcasts the full collection, so nothing is permanently lost.
fn broadcast<T: Clone>(subscribers: &mut Vec<mpsc::Sender<FeedEvent<T>>>, records: &[T]) {
    subscribers.retain(|tx| match tx.try_send(FeedEvent::Snapshot(records.to_vec())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("feed subscriber lagging, emission coalesced");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn subscribe_trips(&self, user: &UserId) -> mpsc::Receiver<FeedEvent<TripRecord>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.write().await;
        let user_data = inner.entry(user.clone()).or_default();
        let _ = tx.try_send(FeedEvent::Snapshot(user_data.trips.clone()));
        user_data.trip_subscribers.push(tx);
        rx
    }

    async fn subscribe_expenses(&self, user: &UserId) -> mpsc::Receiver<FeedEvent<ExpenseRecord>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.write().await;
        let user_data = inner.entry(user.clone()).or_default();
        let _ = tx.try_send(FeedEvent::Snapshot(user_data.expenses.clone()));
        user_data.expense_subscribers.push(tx);
        rx
    }

    async fn fetch_trips_once(&self, user: &UserId) -> Result<Vec<TripRecord>, FeedError> {
        let inner = self.inner.read().await;
        Ok(inner.get(user).map(|u| u.trips.clone()).unwrap_or_default())
    }

    async fn fetch_expenses_once(&self, user: &UserId) -> Result<Vec<ExpenseRecord>, FeedError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(user)
            .map(|u| u.expenses.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn trip(id: &str) -> TripRecord {
        TripRecord {
            id: id.into(),
            name: format!("Trip {id}"),
            destination: String::new(),
            start_date: None,
            end_date: None,
            activities: Vec::new(),
            collaborators: Vec::new(),
            created_at: Timestamp::from_ymd(2025, 1, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn subscription_receives_current_snapshot_first() {
        let store = MemoryStore::new();
        let user: UserId = "u1".into();
        store.put_trip(&user, trip("t1")).await;

        let mut rx = store.subscribe_trips(&user).await;
        match rx.recv().await {
            Some(FeedEvent::Snapshot(trips)) => assert_eq!(trips.len(), 1),
            other => panic!("expected initial snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutation_rebroadcasts_full_collection() {
        let store = MemoryStore::new();
        let user: UserId = "u1".into();
        let mut rx = store.subscribe_trips(&user).await;
        let _ = rx.recv().await; // initial (empty) snapshot

        store.put_trip(&user, trip("t1")).await;
        store.put_trip(&user, trip("t2")).await;
        store.remove_trip(&user, &"t1".into()).await;

        let mut last = Vec::new();
        while let Ok(Some(FeedEvent::Snapshot(trips))) =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await
        {
            last = trips;
        }
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id.as_str(), "t2");
    }

    #[tokio::test]
    async fn empty_id_is_minted() {
        let store = MemoryStore::new();
        let user: UserId = "u1".into();
        let id = store.put_trip(&user, trip("")).await;
        assert!(!id.as_str().is_empty());
    }

    #[tokio::test]
    async fn fail_feed_delivers_terminal_error() {
        let store = MemoryStore::new();
        let user: UserId = "u1".into();
        let mut rx = store.subscribe_trips(&user).await;
        let _ = rx.recv().await;

        store.fail_feed(&user, FeedKind::Trips).await;
        match rx.recv().await {
            Some(FeedEvent::Error(FeedError::Transport { .. })) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
        // Subscriber was dropped — channel closes after the error.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn zero_capacity_is_corrected() {
        let store = MemoryStore::with_capacity(0);
        let user: UserId = "u1".into();
        store.put_trip(&user, trip("t1")).await;

        // A zero-capacity channel would panic on the first subscribe.
        let mut rx = store.subscribe_trips(&user).await;
        match rx.recv().await {
            Some(FeedEvent::Snapshot(trips)) => assert_eq!(trips.len(), 1),
            other => panic!("expected initial snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_once_for_unknown_user_is_empty() {
        let store = MemoryStore::new();
        let trips = store.fetch_trips_once(&"nobody".into()).await.unwrap();
        assert!(trips.is_empty());
    }
}
