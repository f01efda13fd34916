// SPDX-License-Identifier: MIT
//! Triptally engine — real-time trip/expense statistics aggregation.
//!
//! The core is a per-session fan-in: two server-pushed feeds (trips,
//! expenses) merge into one continuously refreshed [`AggregateSnapshot`],
//! with trip lifecycle classified from activity check-ins rather than dates,
//! and an orphan reconciler that detects and repairs expenses whose parent
//! trip was deleted out-of-band.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use triptally::{EngineConfig, StatsEngine};
//! use triptally::feed::memory::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = StatsEngine::new(store, EngineConfig::default());
//! let handle = engine.start(Some("user-1".into())).await;
//! let mut stream = handle.snapshots(); // empty snapshot first, then live
//! ```
//!
//! Everything around the engine — screens, forms, credential exchange — is a
//! collaborator behind the [`feed::RecordStore`] and
//! [`feed::IdentityProvider`] seams.

pub mod classify;
pub mod config;
pub mod expense;
pub mod feed;
pub mod model;
pub mod reconcile;
pub mod stats;

pub use config::EngineConfig;
pub use expense::ExpenseScope;
pub use feed::{FeedError, FeedEvent, FeedKind, IdentityProvider, RecordStore};
pub use model::{ExpenseRecord, TripRecord, UserId};
pub use stats::{statistics_once, AggregateSnapshot, EngineHandle, StatsEngine};
