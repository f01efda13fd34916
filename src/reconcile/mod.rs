// SPDX-License-Identifier: MIT
//! Orphan detection and repair for dangling trip references.
//!
//! When a trip is deleted out-of-band (another device), expenses referencing
//! it survive locally. After every trips-driven publish the reconciler
//! re-derives the valid-trip set, attributes each expense through a
//! prioritized matcher chain, and on finding orphans clears a now-invalid
//! active filter and forces a fresh pull of both feeds. Best-effort and
//! idempotent: an eventually-consistent store may show orphans for one more
//! cycle, in which case the reconciler defers to the next natural emission
//! instead of retry-looping.

use crate::feed::RecordStore;
use crate::model::{ExpenseId, ExpenseRecord, TripId, TripRecord, UserId};
use crate::stats::{EngineHandle, FeedState, UpdateCause};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Legacy convention: before expenses carried a trip id, the app embedded
/// `[trip:<name>]` in the free-text description.
static LEGACY_TRIP_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[trip:([^\]]+)\]").expect("legacy tag regex"));

/// Extract the legacy embedded trip reference from a description, if present.
pub fn legacy_trip_tag(description: &str) -> Option<&str> {
    LEGACY_TRIP_TAG
        .captures(description)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

// ─── Valid-trip set ──────────────────────────────────────────────────────────

/// The currently valid trips, post visibility filtering (shared trips are not
/// valid private-statistics targets). Recomputed per scan, never mutated in
/// place — the aggregator and the reconciler never alias the same set.
pub struct ValidTrips {
    ids: HashSet<TripId>,
    /// Lowercased (name, destination) pairs for legacy-tag matching.
    labels: Vec<(String, String, TripId)>,
    /// Date ranges for the fallback matcher (trips with both dates known).
    ranges: Vec<(TripId, DateTime<Utc>, DateTime<Utc>)>,
}

impl ValidTrips {
    pub fn from_snapshot(trips: &[TripRecord]) -> Self {
        let private: Vec<_> = trips.iter().filter(|t| !t.is_shared()).collect();
        Self {
            ids: private.iter().map(|t| t.id.clone()).collect(),
            labels: private
                .iter()
                .map(|t| {
                    (
                        t.name.trim().to_lowercase(),
                        t.destination.trim().to_lowercase(),
                        t.id.clone(),
                    )
                })
                .collect(),
            ranges: private
                .iter()
                .filter_map(|t| match (t.start_date, t.end_date) {
                    (Some(start), Some(end)) => Some((t.id.clone(), start.0, end.0)),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn contains(&self, id: &TripId) -> bool {
        self.ids.contains(id)
    }

    fn by_label(&self, tag: &str) -> Option<&TripId> {
        let needle = tag.trim().to_lowercase();
        self.labels
            .iter()
            .find(|(name, destination, _)| *name == needle || *destination == needle)
            .map(|(_, _, id)| id)
    }

    fn by_date(&self, at: DateTime<Utc>) -> Option<&TripId> {
        self.ranges
            .iter()
            .find(|(_, start, end)| *start <= at && at <= *end)
            .map(|(id, _, _)| id)
    }
}

// ─── Matcher chain ───────────────────────────────────────────────────────────

/// Why an expense was flagged as orphaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    /// Carries a trip id absent from the valid set.
    StaleId(TripId),
    /// Carries only a legacy tag that no longer names any valid trip.
    StaleTag(String),
}

impl std::fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanReason::StaleId(id) => write!(f, "stale trip id {id}"),
            OrphanReason::StaleTag(tag) => write!(f, "stale legacy tag {tag:?}"),
        }
    }
}

/// Outcome of attributing one expense against the valid-trip set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    /// Resolves to a live trip.
    Valid(TripId),
    /// References a trip that no longer exists.
    Orphaned(OrphanReason),
    /// Carries no reference at all — counted under "all trips", not an orphan.
    Unlinked,
}

/// One attribution strategy. Returns `None` when the strategy does not apply
/// to this expense, letting the next one in the chain try.
pub type Matcher = fn(&ExpenseRecord, &ValidTrips) -> Option<Attribution>;

/// Direct id reference: authoritative when present.
pub fn id_matcher(expense: &ExpenseRecord, valid: &ValidTrips) -> Option<Attribution> {
    let id = expense.trip_id.as_ref()?;
    Some(if valid.contains(id) {
        Attribution::Valid(id.clone())
    } else {
        Attribution::Orphaned(OrphanReason::StaleId(id.clone()))
    })
}

/// Legacy embedded `[trip:<name>]` tag, matched case-insensitively against a
/// valid trip's name or destination. Only consulted when no id is present.
pub fn legacy_tag_matcher(expense: &ExpenseRecord, valid: &ValidTrips) -> Option<Attribution> {
    if expense.trip_id.is_some() {
        return None;
    }
    let tag = legacy_trip_tag(expense.description.as_deref()?)?;
    Some(match valid.by_label(tag) {
        Some(id) => Attribution::Valid(id.clone()),
        None => Attribution::Orphaned(OrphanReason::StaleTag(tag.to_string())),
    })
}

/// Fallback: an untagged expense created inside some valid trip's date range
/// is attributed to that trip. This strategy can only attribute, never orphan.
pub fn date_range_matcher(expense: &ExpenseRecord, valid: &ValidTrips) -> Option<Attribution> {
    valid
        .by_date(expense.created_at.0)
        .map(|id| Attribution::Valid(id.clone()))
}

/// The prioritized rule chain, tried in order; first match wins.
pub const MATCHER_CHAIN: &[(&str, Matcher)] = &[
    ("id", id_matcher),
    ("legacy-tag", legacy_tag_matcher),
    ("date-range", date_range_matcher),
];

/// Attribute one expense through the chain.
pub fn attribute(expense: &ExpenseRecord, valid: &ValidTrips) -> Attribution {
    for (_, matcher) in MATCHER_CHAIN {
        if let Some(attribution) = matcher(expense, valid) {
            return attribution;
        }
    }
    Attribution::Unlinked
}

/// Scan a full expense snapshot for orphans.
pub fn find_orphans(
    expenses: &[ExpenseRecord],
    valid: &ValidTrips,
) -> Vec<(ExpenseId, OrphanReason)> {
    expenses
        .iter()
        .filter_map(|e| match attribute(e, valid) {
            Attribution::Orphaned(reason) => Some((e.id.clone(), reason)),
            _ => None,
        })
        .collect()
}

// ─── Reconciler task ─────────────────────────────────────────────────────────

/// Downstream consumer of the engine's feed state. One per session.
pub struct OrphanReconciler;

impl OrphanReconciler {
    /// Spawn the reconciler alongside a running engine. The task winds down
    /// when the engine stops (feed-state sender dropped or shutdown flagged).
    pub fn spawn(
        handle: EngineHandle,
        store: Arc<dyn RecordStore>,
        user: UserId,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut feed_rx = handle.feed_state();
            let mut shutdown_rx = handle.shutdown();
            // The watch channel coalesces bursts, so a Trips-caused publish
            // may already be overwritten when we wake. Tracking the trip
            // half's own sequence number never misses a trips change.
            let mut seen_trips_seq = 0u64;
            loop {
                tokio::select! {
                    changed = feed_rx.changed() => {
                        if changed.is_err() {
                            break; // engine loop exited
                        }
                        let state = feed_rx.borrow_and_update().clone();
                        if state.trips_seq <= seen_trips_seq {
                            continue;
                        }
                        seen_trips_seq = state.trips_seq;
                        if state.cause == UpdateCause::Refetch {
                            // A refetch we triggered. If orphans persist the
                            // store is not yet consistent — defer to the next
                            // natural emission rather than retry-loop.
                            let valid = ValidTrips::from_snapshot(&state.trips);
                            let remaining = find_orphans(&state.expenses, &valid);
                            if !remaining.is_empty() {
                                debug!(
                                    remaining = remaining.len(),
                                    "orphans persist after refetch, deferring"
                                );
                            }
                        } else {
                            repair(&handle, store.as_ref(), &user, &state, &mut shutdown_rx)
                                .await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("orphan reconciler stopped");
        })
    }
}

/// Scan, and on orphans: clear a now-invalid filter, then force-refetch both
/// feeds and inject the fresh snapshots. The refetch is cancellable — once
/// shutdown is flagged nothing is injected (and so nothing is published).
async fn repair(
    handle: &EngineHandle,
    store: &dyn RecordStore,
    user: &UserId,
    state: &FeedState,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let valid = ValidTrips::from_snapshot(&state.trips);
    let orphans = find_orphans(&state.expenses, &valid);
    if orphans.is_empty() {
        return;
    }
    for (expense, reason) in &orphans {
        warn!(expense = %expense, %reason, "orphaned expense");
    }

    if let Some(filter_id) = state.scope.trip_id() {
        if !valid.contains(filter_id) {
            info!(trip = %filter_id, "active filter points at a deleted trip, resetting to all trips");
            handle.set_trip_filter(None).await;
        }
    }

    let refetch = async {
        let trips = store.fetch_trips_once(user).await?;
        let expenses = store.fetch_expenses_once(user).await?;
        Ok::<_, crate::feed::FeedError>((trips, expenses))
    };
    tokio::select! {
        result = refetch => match result {
            Ok((trips, expenses)) => {
                info!(orphans = orphans.len(), "forced refetch complete, re-running aggregation");
                handle.inject_refetched(trips, expenses).await;
            }
            Err(err) => {
                warn!(%err, "forced refetch failed, deferring to next feed emission");
            }
        },
        _ = async { let _ = shutdown_rx.wait_for(|stopped| *stopped).await; } => {
            debug!("refetch cancelled by shutdown, nothing published");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn trip(id: &str, name: &str, destination: &str) -> TripRecord {
        TripRecord {
            id: id.into(),
            name: name.to_string(),
            destination: destination.to_string(),
            start_date: Timestamp::from_ymd(2025, 1, 1),
            end_date: Timestamp::from_ymd(2025, 1, 5),
            activities: Vec::new(),
            collaborators: Vec::new(),
            created_at: Timestamp::from_ymd(2024, 12, 1).unwrap(),
        }
    }

    fn expense(id: &str, trip: Option<&str>, description: Option<&str>) -> ExpenseRecord {
        ExpenseRecord {
            id: id.into(),
            amount: 10.0,
            created_at: Timestamp::from_ymd(2025, 6, 1).unwrap(),
            trip_id: trip.map(Into::into),
            description: description.map(ToString::to_string),
        }
    }

    #[test]
    fn legacy_tag_extraction() {
        assert_eq!(legacy_trip_tag("dinner [trip:Kyoto]"), Some("Kyoto"));
        assert_eq!(legacy_trip_tag("[TRIP: Winter Break ] taxi"), Some("Winter Break"));
        assert_eq!(legacy_trip_tag("no tag here"), None);
    }

    #[test]
    fn id_matcher_is_authoritative() {
        let valid = ValidTrips::from_snapshot(&[trip("T1", "Kyoto", "Japan")]);
        assert_eq!(
            id_matcher(&expense("e1", Some("T1"), None), &valid),
            Some(Attribution::Valid("T1".into()))
        );
        assert_eq!(
            id_matcher(&expense("e2", Some("T2"), None), &valid),
            Some(Attribution::Orphaned(OrphanReason::StaleId("T2".into())))
        );
        assert_eq!(id_matcher(&expense("e3", None, None), &valid), None);
    }

    #[test]
    fn legacy_tag_matches_name_or_destination() {
        let valid = ValidTrips::from_snapshot(&[trip("T1", "Winter Break", "Kyoto")]);
        let by_name = expense("e1", None, Some("sushi [trip:winter break]"));
        let by_dest = expense("e2", None, Some("sushi [trip:KYOTO]"));
        let stale = expense("e3", None, Some("sushi [trip:Summer]"));
        assert_eq!(
            legacy_tag_matcher(&by_name, &valid),
            Some(Attribution::Valid("T1".into()))
        );
        assert_eq!(
            legacy_tag_matcher(&by_dest, &valid),
            Some(Attribution::Valid("T1".into()))
        );
        assert_eq!(
            legacy_tag_matcher(&stale, &valid),
            Some(Attribution::Orphaned(OrphanReason::StaleTag(
                "Summer".to_string()
            )))
        );
    }

    #[test]
    fn legacy_tag_skipped_when_id_present() {
        let valid = ValidTrips::from_snapshot(&[trip("T1", "Kyoto", "")]);
        let e = expense("e1", Some("T1"), Some("[trip:Somewhere Else]"));
        assert_eq!(legacy_tag_matcher(&e, &valid), None);
        // The chain resolves it by id, priority order.
        assert_eq!(attribute(&e, &valid), Attribution::Valid("T1".into()));
    }

    #[test]
    fn date_range_fallback_attributes_but_never_orphans() {
        let mut summer = trip("T1", "Summer", "");
        summer.start_date = Timestamp::from_ymd(2025, 5, 20);
        summer.end_date = Timestamp::from_ymd(2025, 6, 10);
        let valid = ValidTrips::from_snapshot(&[summer]);

        let inside = expense("e1", None, None); // created 2025-06-01
        assert_eq!(
            date_range_matcher(&inside, &valid),
            Some(Attribution::Valid("T1".into()))
        );

        let mut outside = expense("e2", None, None);
        outside.created_at = Timestamp::from_ymd(2025, 9, 1).unwrap();
        assert_eq!(date_range_matcher(&outside, &valid), None);
        assert_eq!(attribute(&outside, &valid), Attribution::Unlinked);
    }

    #[test]
    fn find_orphans_flags_exactly_the_stale_reference() {
        let valid = ValidTrips::from_snapshot(&[trip("T1", "Kyoto", "")]);
        let expenses = vec![
            expense("E1", Some("T1"), None),
            expense("E2", Some("T2"), None),
        ];
        let orphans = find_orphans(&expenses, &valid);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, "E2".into());
        assert_eq!(orphans[0].1, OrphanReason::StaleId("T2".into()));
    }

    #[test]
    fn shared_trips_are_not_valid_targets() {
        let mut shared = trip("T1", "Kyoto", "");
        shared.collaborators.push("friend@example.com".to_string());
        let valid = ValidTrips::from_snapshot(&[shared]);
        assert!(!valid.contains(&"T1".into()));
        // An expense pointing at the shared trip is an orphan for private stats.
        let orphans = find_orphans(&[expense("e1", Some("T1"), None)], &valid);
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn scan_is_idempotent() {
        let valid = ValidTrips::from_snapshot(&[trip("T1", "Kyoto", "")]);
        let expenses = vec![expense("E2", Some("T2"), None)];
        let first = find_orphans(&expenses, &valid);
        let second = find_orphans(&expenses, &valid);
        assert_eq!(first, second);
    }
}
