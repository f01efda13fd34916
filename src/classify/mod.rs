// SPDX-License-Identifier: MIT
//! Trip lifecycle classification — pure, no I/O.
//!
//! Completion is a predicate over the activity set, not the calendar: a trip
//! is Completed only when every location-based activity has been checked in
//! or ticked off. A trip whose end date passed with unchecked activities
//! lands in the explicit `Undetermined` bucket instead of being silently
//! counted as completed or ongoing.

use crate::model::TripRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle status of a private trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Upcoming,
    Active,
    Completed,
    /// End date has passed but location-based activities remain unchecked.
    /// Surfaced explicitly as a "needs attention" bucket.
    Undetermined,
}

/// Per-trip contribution to the aggregate, for one private trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripFacts {
    pub status: TripStatus,
    /// All activities on the trip, visitable or not.
    pub activity_count: u64,
    /// Visitable activities the user has checked in at (or marked done).
    pub checked_in_count: u64,
    /// Whether [start, end] overlaps the reference calendar year
    /// (creation year when dates are absent).
    pub in_reference_year: bool,
}

/// Classify one trip. Returns `None` for shared trips — they are excluded
/// from private statistics entirely.
pub fn classify_trip(
    trip: &TripRecord,
    now: DateTime<Utc>,
    reference_year: i32,
) -> Option<TripFacts> {
    if trip.is_shared() {
        return None;
    }

    let visitable: Vec<_> = trip
        .activities
        .iter()
        .filter(|a| a.category.is_visitable())
        .collect();
    let checked_in_count = visitable.iter().filter(|a| a.is_done()).count() as u64;

    let completed = !visitable.is_empty() && checked_in_count == visitable.len() as u64;

    let status = if completed {
        TripStatus::Completed
    } else {
        match (trip.start_date, trip.end_date) {
            (Some(start), _) if start.0 > now => TripStatus::Upcoming,
            (_, Some(end)) if end.0 < now => TripStatus::Undetermined,
            // In-range dates, or no dates to prove otherwise.
            _ => TripStatus::Active,
        }
    };

    Some(TripFacts {
        status,
        activity_count: trip.activities.len() as u64,
        checked_in_count,
        in_reference_year: in_reference_year(trip, reference_year),
    })
}

/// Interval overlap of [start, end] with the reference calendar year,
/// falling back to the creation timestamp's year when dates are absent.
/// A single known date stands in for the missing one.
fn in_reference_year(trip: &TripRecord, reference_year: i32) -> bool {
    let start = trip.start_date.or(trip.end_date);
    let end = trip.end_date.or(trip.start_date);
    match (start, end) {
        (Some(start), Some(end)) => start.year() <= reference_year && end.year() >= reference_year,
        _ => trip.created_at.year() == reference_year,
    }
}
