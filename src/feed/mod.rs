// SPDX-License-Identifier: MIT
//! The ChangeFeed boundary — live, server-pushed collection snapshots.
//!
//! A feed is always-total: every emission is the complete current collection
//! for one user, never a delta. Transport failures arrive in-band as a
//! terminal [`FeedEvent::Error`]; the engine downgrades to last-known-good
//! state instead of crashing.

pub mod memory;

use crate::model::{ExpenseRecord, TripRecord, UserId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Which of the two per-session feeds an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Trips,
    Expenses,
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedKind::Trips => f.write_str("trips"),
            FeedKind::Expenses => f.write_str("expenses"),
        }
    }
}

/// Errors surfaced by a feed subscription or a one-shot fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    /// The underlying transport dropped. Terminal for the subscription that
    /// reported it; the engine keeps the last-known snapshot for that half.
    #[error("feed transport error: {message}")]
    Transport { message: String },
    /// The store has shut down and will emit nothing further.
    #[error("feed closed")]
    Closed,
}

/// One emission on a feed: a full authoritative snapshot, or a terminal error.
#[derive(Debug, Clone)]
pub enum FeedEvent<T> {
    Snapshot(Vec<T>),
    Error(FeedError),
}

/// Narrow interface to the storage collaborator.
///
/// `subscribe_*` establishes a live feed; establishing it may take a server
/// round trip, so implementations SHOULD emit the current collection as the
/// first event but callers must be usable before it arrives. `fetch_*_once`
/// bypasses any cache — it backs the one-shot statistics query and the
/// reconciler's forced refetches.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn subscribe_trips(&self, user: &UserId) -> mpsc::Receiver<FeedEvent<TripRecord>>;

    async fn subscribe_expenses(&self, user: &UserId) -> mpsc::Receiver<FeedEvent<ExpenseRecord>>;

    async fn fetch_trips_once(&self, user: &UserId) -> Result<Vec<TripRecord>, FeedError>;

    async fn fetch_expenses_once(&self, user: &UserId) -> Result<Vec<ExpenseRecord>, FeedError>;
}

/// The identity collaborator, reduced to the one capability the engine needs.
///
/// An absent user is a normal logged-out session: statistics surfaces return
/// the empty snapshot, never an error.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
}
