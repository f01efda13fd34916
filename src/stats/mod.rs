// SPDX-License-Identifier: MIT
//! Statistics aggregation — the session's fan-in core.
//!
//! Two independently arriving feeds (trips, expenses) are merged into one
//! continuously refreshed [`AggregateSnapshot`]. A single spawned task owns
//! the only mutable copy of the sub-state pair and selects over both feed
//! receivers, a command channel, and a shutdown signal; consumers only ever
//! see immutable published clones. If one feed dies, the last good half stays
//! in place and the healthy feed keeps flowing — degraded, never blocked.

use crate::classify::{classify_trip, TripStatus};
use crate::config::EngineConfig;
use crate::expense::{aggregate_expenses, ExpenseScope, ExpenseTotals};
use crate::feed::{FeedError, FeedEvent, FeedKind, IdentityProvider, RecordStore};
use crate::model::{ExpenseRecord, TripId, TripRecord, UserId};
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

// ─── Snapshot types ──────────────────────────────────────────────────────────

/// Counters restricted to the reference calendar year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearSlice {
    pub total_activities: u64,
    pub completed_trips: u64,
    pub ongoing_trips: u64,
    pub upcoming_trips: u64,
    pub undetermined_trips: u64,
    pub total_plans: u64,
    pub checked_in_locations: u64,
    pub total_expenses: f64,
    /// `"YYYY-MM"` → expense sum, restricted to the reference year.
    pub monthly_expenses: BTreeMap<String, f64>,
    pub average_expense_per_trip: f64,
}

/// The engine's sole derived entity: one merged, internally consistent view
/// of the last-seen state of each feed.
///
/// Published as an immutable clone on every update; consumers never mutate
/// it. Created empty at subscription time, so trip-derived fields reflect a
/// clean initial state until the Trips feed first emits (and vice versa).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub total_activities: u64,
    pub completed_trips: u64,
    pub ongoing_trips: u64,
    pub upcoming_trips: u64,
    /// Trips whose end date passed with unchecked location activities.
    /// An explicit "needs attention" bucket — not completed, not ongoing.
    pub undetermined_trips: u64,
    /// Private (collaborator-free) trips.
    pub total_plans: u64,
    pub checked_in_locations: u64,
    pub total_expenses: f64,
    /// `"YYYY-MM"` → expense sum for that month.
    pub monthly_expenses: BTreeMap<String, f64>,
    /// `totalExpenses / max(1, completedTrips)` — always finite.
    pub average_expense_per_trip: f64,
    pub reference_year: i32,
    /// The same counters restricted to the reference year.
    pub reference: YearSlice,
}

impl AggregateSnapshot {
    /// The zero-valued snapshot published before any feed has emitted
    /// (and for the whole session when no user is signed in).
    pub fn empty(reference_year: i32) -> Self {
        Self {
            total_activities: 0,
            completed_trips: 0,
            ongoing_trips: 0,
            upcoming_trips: 0,
            undetermined_trips: 0,
            total_plans: 0,
            checked_in_locations: 0,
            total_expenses: 0.0,
            monthly_expenses: BTreeMap::new(),
            average_expense_per_trip: 0.0,
            reference_year,
            reference: YearSlice::default(),
        }
    }
}

// ─── Sub-states ──────────────────────────────────────────────────────────────

/// Trip-derived counters, one set over all private trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripCounts {
    pub total_activities: u64,
    pub completed_trips: u64,
    pub ongoing_trips: u64,
    pub upcoming_trips: u64,
    pub undetermined_trips: u64,
    pub total_plans: u64,
    pub checked_in_locations: u64,
}

impl TripCounts {
    fn absorb(&mut self, facts: &crate::classify::TripFacts) {
        self.total_plans += 1;
        self.total_activities += facts.activity_count;
        self.checked_in_locations += facts.checked_in_count;
        match facts.status {
            TripStatus::Completed => self.completed_trips += 1,
            TripStatus::Active => self.ongoing_trips += 1,
            TripStatus::Upcoming => self.upcoming_trips += 1,
            TripStatus::Undetermined => self.undetermined_trips += 1,
        }
    }
}

/// The trip half of the merged state, overwritten whole on every Trips
/// emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripsDerived {
    pub all: TripCounts,
    pub reference: TripCounts,
}

/// Recompute the trip half from a full snapshot. Pure.
pub fn derive_trips(trips: &[TripRecord], now: DateTime<Utc>, reference_year: i32) -> TripsDerived {
    let mut derived = TripsDerived::default();
    for trip in trips {
        let Some(facts) = classify_trip(trip, now, reference_year) else {
            continue; // shared trip — excluded from private statistics
        };
        derived.all.absorb(&facts);
        if facts.in_reference_year {
            derived.reference.absorb(&facts);
        }
    }
    derived
}

/// Pure merge of the two halves. Deterministic: the same sub-state pair
/// always produces an identical snapshot.
pub fn merge(trips: &TripsDerived, expenses: &ExpenseTotals, reference_year: i32) -> AggregateSnapshot {
    let average = expenses.total / trips.all.completed_trips.max(1) as f64;
    let reference_average =
        expenses.reference_year_total / trips.reference.completed_trips.max(1) as f64;
    AggregateSnapshot {
        total_activities: trips.all.total_activities,
        completed_trips: trips.all.completed_trips,
        ongoing_trips: trips.all.ongoing_trips,
        upcoming_trips: trips.all.upcoming_trips,
        undetermined_trips: trips.all.undetermined_trips,
        total_plans: trips.all.total_plans,
        checked_in_locations: trips.all.checked_in_locations,
        total_expenses: expenses.total,
        monthly_expenses: expenses.by_month.clone(),
        average_expense_per_trip: average,
        reference_year,
        reference: YearSlice {
            total_activities: trips.reference.total_activities,
            completed_trips: trips.reference.completed_trips,
            ongoing_trips: trips.reference.ongoing_trips,
            upcoming_trips: trips.reference.upcoming_trips,
            undetermined_trips: trips.reference.undetermined_trips,
            total_plans: trips.reference.total_plans,
            checked_in_locations: trips.reference.checked_in_locations,
            total_expenses: expenses.reference_year_total,
            monthly_expenses: expenses.reference_year_by_month.clone(),
            average_expense_per_trip: reference_average,
        },
    }
}

// ─── Engine plumbing ─────────────────────────────────────────────────────────

/// What caused the latest publish. The reconciler only reacts to `Trips`
/// (full repair) and `Refetch` (race check, no re-trigger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCause {
    /// Seeded initial state — nothing has been observed yet.
    Init,
    Trips,
    Expenses,
    Filter,
    Refetch,
}

/// Latest raw feed state, shared with the reconciler through a watch channel.
/// Rebuilt per publish; the `Arc`s are never mutated in place.
#[derive(Debug, Clone)]
pub struct FeedState {
    pub trips: Arc<Vec<TripRecord>>,
    pub expenses: Arc<Vec<ExpenseRecord>>,
    pub scope: ExpenseScope,
    pub cause: UpdateCause,
    pub seq: u64,
    /// Bumped every time the trip half is overwritten. The watch channel
    /// coalesces bursts, so the reconciler keys off this instead of `cause`
    /// to never miss a trips change.
    pub trips_seq: u64,
}

impl FeedState {
    fn initial() -> Self {
        Self {
            trips: Arc::new(Vec::new()),
            expenses: Arc::new(Vec::new()),
            scope: ExpenseScope::AllTrips,
            cause: UpdateCause::Init,
            seq: 0,
            trips_seq: 0,
        }
    }
}

/// Commands accepted by the engine loop. All state mutation funnels through
/// the loop task — the single-writer discipline for the merge.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    SetTripFilter(Option<TripId>),
    /// Fresh fetch-once results injected by the reconciler.
    Refetched {
        trips: Vec<TripRecord>,
        expenses: Vec<ExpenseRecord>,
    },
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Cloneable handle to one session's running engine.
#[derive(Clone)]
pub struct EngineHandle {
    snapshot_tx: broadcast::Sender<AggregateSnapshot>,
    latest_rx: watch::Receiver<AggregateSnapshot>,
    feed_rx: watch::Receiver<FeedState>,
    command_tx: mpsc::Sender<EngineCommand>,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineHandle {
    /// The `GetStatisticsStream` surface: yields the current snapshot
    /// immediately, then every published update until [`stop`](Self::stop).
    ///
    /// Lagging consumers skip over missed snapshots (last-write-wins) rather
    /// than stalling the engine.
    pub fn snapshots(&self) -> impl Stream<Item = AggregateSnapshot> + Send + Unpin {
        let current = self.latest();
        let live = BroadcastStream::new(self.snapshot_tx.subscribe())
            .filter_map(|result| async move { result.ok() });
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stopped = async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        }
        .boxed();
        tokio_stream::once(current)
            .chain(live)
            .take_until(stopped)
            .boxed()
    }

    /// Current snapshot without subscribing.
    pub fn latest(&self) -> AggregateSnapshot {
        self.latest_rx.borrow().clone()
    }

    /// `SetActiveTripFilter`: restrict the expense half to one trip, or
    /// `None` for all trips. The engine recomputes and republishes.
    pub async fn set_trip_filter(&self, trip: Option<TripId>) {
        let _ = self
            .command_tx
            .send(EngineCommand::SetTripFilter(trip))
            .await;
    }

    /// Stop the session: the loop unsubscribes both feeds, the reconciler
    /// winds down, and every snapshot stream ends. Idempotent.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub(crate) fn feed_state(&self) -> watch::Receiver<FeedState> {
        self.feed_rx.clone()
    }

    pub(crate) fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) async fn inject_refetched(
        &self,
        trips: Vec<TripRecord>,
        expenses: Vec<ExpenseRecord>,
    ) {
        let _ = self
            .command_tx
            .send(EngineCommand::Refetched { trips, expenses })
            .await;
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Session-scoped statistics engine. Explicitly constructed per session —
/// never a process-wide singleton.
pub struct StatsEngine {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
}

impl StatsEngine {
    pub fn new(store: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the engine for the identity provider's current user.
    pub async fn start_current(&self, identity: &dyn IdentityProvider) -> EngineHandle {
        self.start(identity.current_user()).await
    }

    /// Subscribe both feeds and spawn the aggregation loop (plus the orphan
    /// reconciler unless disabled).
    ///
    /// `None` user is a normal logged-out session: the handle has already
    /// published the empty snapshot and will never publish again.
    pub async fn start(&self, user: Option<UserId>) -> EngineHandle {
        let reference_year = self.config.reference_year;
        let (snapshot_tx, _) = broadcast::channel(self.config.channel_capacity);
        let (latest_tx, latest_rx) = watch::channel(AggregateSnapshot::empty(reference_year));
        let (feed_tx, feed_rx) = watch::channel(FeedState::initial());
        let (command_tx, command_rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = EngineHandle {
            snapshot_tx: snapshot_tx.clone(),
            latest_rx,
            feed_rx,
            command_tx,
            shutdown_tx,
        };

        let Some(user) = user else {
            debug!("statistics requested with no signed-in user, serving empty snapshot");
            return handle;
        };

        let trips_rx = self.store.subscribe_trips(&user).await;
        let expenses_rx = self.store.subscribe_expenses(&user).await;
        info!(user = %user, "statistics engine started");

        let state = MergeState {
            reference_year,
            snapshot_tx,
            latest_tx,
            feed_tx,
            raw_trips: Arc::new(Vec::new()),
            raw_expenses: Arc::new(Vec::new()),
            scope: ExpenseScope::AllTrips,
            trips_derived: TripsDerived::default(),
            expense_totals: ExpenseTotals::default(),
            seq: 0,
            trips_seq: 0,
        };
        tokio::spawn(run_loop(
            state,
            trips_rx,
            expenses_rx,
            command_rx,
            shutdown_rx,
        ));

        if self.config.reconcile.enabled {
            crate::reconcile::OrphanReconciler::spawn(
                handle.clone(),
                Arc::clone(&self.store),
                user,
            );
        }

        handle
    }
}

/// One-shot `GetStatisticsOnce`: two fetch-once calls, classify + aggregate +
/// merge, no subscription. Absent user yields the empty snapshot.
pub async fn statistics_once(
    store: &dyn RecordStore,
    config: &EngineConfig,
    user: Option<&UserId>,
) -> Result<AggregateSnapshot, FeedError> {
    let Some(user) = user else {
        return Ok(AggregateSnapshot::empty(config.reference_year));
    };
    let trips = store.fetch_trips_once(user).await?;
    let expenses = store.fetch_expenses_once(user).await?;
    let trips_derived = derive_trips(&trips, Utc::now(), config.reference_year);
    let totals = aggregate_expenses(&expenses, &ExpenseScope::AllTrips, config.reference_year);
    Ok(merge(&trips_derived, &totals, config.reference_year))
}

// ─── Loop task ───────────────────────────────────────────────────────────────

/// The single writer: owns the sub-state pair and every publish channel.
struct MergeState {
    reference_year: i32,
    snapshot_tx: broadcast::Sender<AggregateSnapshot>,
    latest_tx: watch::Sender<AggregateSnapshot>,
    feed_tx: watch::Sender<FeedState>,
    raw_trips: Arc<Vec<TripRecord>>,
    raw_expenses: Arc<Vec<ExpenseRecord>>,
    scope: ExpenseScope,
    trips_derived: TripsDerived,
    expense_totals: ExpenseTotals,
    seq: u64,
    trips_seq: u64,
}

async fn run_loop(
    mut state: MergeState,
    mut trips_rx: mpsc::Receiver<FeedEvent<TripRecord>>,
    mut expenses_rx: mpsc::Receiver<FeedEvent<ExpenseRecord>>,
    mut command_rx: mpsc::Receiver<EngineCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // A closed receiver returns `None` immediately, so each feed arm is
    // disabled once its subscription ends to keep the select from spinning.
    let mut trips_open = true;
    let mut expenses_open = true;

    loop {
        tokio::select! {
            event = trips_rx.recv(), if trips_open => match event {
                Some(FeedEvent::Snapshot(trips)) => {
                    state.apply_trips(trips);
                    state.publish(UpdateCause::Trips);
                }
                Some(FeedEvent::Error(err)) => {
                    warn!(feed = %FeedKind::Trips, %err, "feed failed, keeping last-known trip state");
                    trips_open = false;
                }
                None => trips_open = false,
            },
            event = expenses_rx.recv(), if expenses_open => match event {
                Some(FeedEvent::Snapshot(expenses)) => {
                    state.apply_expenses(expenses);
                    state.publish(UpdateCause::Expenses);
                }
                Some(FeedEvent::Error(err)) => {
                    warn!(feed = %FeedKind::Expenses, %err, "feed failed, keeping last-known expense state");
                    expenses_open = false;
                }
                None => expenses_open = false,
            },
            command = command_rx.recv() => match command {
                Some(EngineCommand::SetTripFilter(trip)) => {
                    state.scope = match trip {
                        Some(id) => ExpenseScope::Trip(id),
                        None => ExpenseScope::AllTrips,
                    };
                    state.recompute_expenses();
                    state.publish(UpdateCause::Filter);
                }
                Some(EngineCommand::Refetched { trips, expenses }) => {
                    state.apply_trips(trips);
                    state.apply_expenses(expenses);
                    state.publish(UpdateCause::Refetch);
                }
                None => break, // every handle dropped
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("statistics engine loop stopped");
}

impl MergeState {
    fn apply_trips(&mut self, trips: Vec<TripRecord>) {
        self.raw_trips = Arc::new(trips);
        self.trips_derived = derive_trips(&self.raw_trips, Utc::now(), self.reference_year);
        self.trips_seq += 1;
    }

    fn apply_expenses(&mut self, expenses: Vec<ExpenseRecord>) {
        self.raw_expenses = Arc::new(expenses);
        self.recompute_expenses();
    }

    fn recompute_expenses(&mut self) {
        self.expense_totals =
            aggregate_expenses(&self.raw_expenses, &self.scope, self.reference_year);
    }

    /// Merge both halves and publish the immutable result everywhere:
    /// broadcast (live streams), watch (latest value), feed state (reconciler).
    fn publish(&mut self, cause: UpdateCause) {
        self.seq += 1;
        let snapshot = merge(&self.trips_derived, &self.expense_totals, self.reference_year);
        self.latest_tx.send_replace(snapshot.clone());
        // No subscribers is fine.
        let _ = self.snapshot_tx.send(snapshot);
        self.feed_tx.send_replace(FeedState {
            trips: Arc::clone(&self.raw_trips),
            expenses: Arc::clone(&self.raw_expenses),
            scope: self.scope.clone(),
            cause,
            seq: self.seq,
            trips_seq: self.trips_seq,
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
