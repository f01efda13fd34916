// SPDX-License-Identifier: MIT
//! Shared data model — record types crossing the feed boundary.
//!
//! The engine is storage-agnostic: records arrive from whatever backend the
//! embedder wires in, so every timestamp is normalized to UTC here, at the
//! boundary, and the rest of the crate only ever sees [`Timestamp`].
//! Malformed records are a per-record condition — [`decode_records`] skips
//! the one bad entry instead of aborting the whole snapshot.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ─── Opaque identifiers ──────────────────────────────────────────────────────

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// Opaque, store-assigned trip document id.
    TripId
);
id_type!(
    /// Opaque, store-assigned expense document id.
    ExpenseId
);
id_type!(
    /// Stable user identifier handed over by the identity collaborator.
    UserId
);

// ─── Timestamp ───────────────────────────────────────────────────────────────

/// A UTC instant, normalized at the feed boundary.
///
/// Accepts (in decreasing priority) RFC 3339 / ISO 8601 strings, bare
/// `YYYY-MM-DD` dates, integer epoch milliseconds (epoch seconds when the
/// magnitude is too small to be milliseconds), and float epoch seconds.
/// Always serializes as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Self(Utc.from_utc_datetime(&dt)))
    }

    /// Calendar year of this instant (UTC).
    pub fn year(&self) -> i32 {
        use chrono::Datelike;
        self.0.year()
    }

    /// `"YYYY-MM"` bucket key used for monthly expense sums.
    pub fn month_key(&self) -> String {
        self.0.format("%Y-%m").to_string()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

// Threshold above which an integer is epoch milliseconds rather than seconds
// (10^12 ms ≈ 2001-09-09; no trip record predates the product).
const EPOCH_MILLIS_FLOOR: i64 = 1_000_000_000_000;

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    None
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TsVisitor;

        impl Visitor<'_> for TsVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an ISO 8601 string or numeric epoch timestamp")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                parse_timestamp_str(v)
                    .map(Timestamp)
                    .ok_or_else(|| E::custom(format!("unparseable timestamp: {v:?}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
                let dt = if v.abs() >= EPOCH_MILLIS_FLOOR {
                    Utc.timestamp_millis_opt(v).single()
                } else {
                    Utc.timestamp_opt(v, 0).single()
                };
                dt.map(Timestamp)
                    .ok_or_else(|| E::custom(format!("epoch timestamp out of range: {v}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
                i64::try_from(v)
                    .map_err(|_| E::custom(format!("epoch timestamp out of range: {v}")))
                    .and_then(|v| self.visit_i64(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
                Utc.timestamp_opt(v.trunc() as i64, (v.fract() * 1e9) as u32)
                    .single()
                    .map(Timestamp)
                    .ok_or_else(|| E::custom(format!("epoch timestamp out of range: {v}")))
            }
        }

        deserializer.deserialize_any(TsVisitor)
    }
}

// ─── Activities ──────────────────────────────────────────────────────────────

/// A trip activity's category tag.
///
/// The location-based ("visitable") subset lives in [`ActivityCategory::is_visitable`]
/// so extending the enumeration never touches classifier control flow.
/// Unknown wire tags decode as `Misc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Lodging,
    Restaurant,
    Tour,
    Transit,
    Shopping,
    Note,
    #[serde(other)]
    Misc,
}

impl ActivityCategory {
    /// True for categories representing a place the user can physically
    /// check into, as opposed to abstract entries (notes, miscellaneous).
    pub fn is_visitable(self) -> bool {
        matches!(
            self,
            Self::Lodging | Self::Restaurant | Self::Tour | Self::Transit | Self::Shopping
        )
    }
}

/// An activity embedded in a trip. No identity outside its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub category: ActivityCategory,
    /// The user physically checked in at the location.
    #[serde(default)]
    pub checked_in: bool,
    /// Marked done without a check-in (e.g. manually ticked off).
    #[serde(default)]
    pub completed: bool,
}

impl ActivityRecord {
    /// Checked-in or separately marked completed.
    pub fn is_done(&self) -> bool {
        self.checked_in || self.completed
    }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// A trip document as emitted by the Trips feed. Read-only cached copy;
/// the store owns the authoritative version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripRecord {
    pub id: TripId,
    pub name: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub start_date: Option<Timestamp>,
    #[serde(default)]
    pub end_date: Option<Timestamp>,
    #[serde(default)]
    pub activities: Vec<ActivityRecord>,
    /// Non-empty means the trip is shared and excluded from private statistics.
    #[serde(default)]
    pub collaborators: Vec<String>,
    pub created_at: Timestamp,
}

impl TripRecord {
    pub fn is_shared(&self) -> bool {
        !self.collaborators.is_empty()
    }
}

/// An expense document as emitted by the Expenses feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecord {
    pub id: ExpenseId,
    /// Amount actually spent, in the single reporting currency.
    pub amount: f64,
    pub created_at: Timestamp,
    /// SHOULD reference a live trip, but may be stale (parent deleted from
    /// another device) or absent with only a legacy tag in `description`.
    #[serde(default)]
    pub trip_id: Option<TripId>,
    #[serde(default)]
    pub description: Option<String>,
}

// ─── Boundary decoding ───────────────────────────────────────────────────────

/// Decode a raw collection snapshot, skipping records that fail to parse.
///
/// A single malformed document must never abort a recomputation; it
/// contributes nothing and is logged at warn.
pub fn decode_records<T: serde::de::DeserializeOwned>(
    collection: &str,
    raw: Vec<serde_json::Value>,
) -> Vec<T> {
    let total = raw.len();
    let records: Vec<T> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%collection, %err, "skipping malformed record");
                None
            }
        })
        .collect();
    if records.len() < total {
        warn!(
            %collection,
            skipped = total - records.len(),
            kept = records.len(),
            "snapshot decoded with malformed records dropped"
        );
    }
    records
}

// ─── Tests ───────────────────────────────────────────────────────────────────
