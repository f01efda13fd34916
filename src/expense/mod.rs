// SPDX-License-Identifier: MIT
//! Expense aggregation — pure, no I/O.
//!
//! Sums a full expense snapshot into a total and `"YYYY-MM"` month buckets,
//! restricted to the active scope. Amounts are plain f64 in one reporting
//! currency; no conversion happens here. The average-per-completed-trip
//! figure is NOT computed here — it needs the trip half, so the merge step
//! owns it.

use crate::model::{ExpenseRecord, TripId};
use std::collections::BTreeMap;
use tracing::warn;

/// The consumer's active expense scope: everything, or one trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpenseScope {
    #[default]
    AllTrips,
    Trip(TripId),
}

impl ExpenseScope {
    pub fn matches(&self, expense: &ExpenseRecord) -> bool {
        match self {
            ExpenseScope::AllTrips => true,
            ExpenseScope::Trip(id) => expense.trip_id.as_ref() == Some(id),
        }
    }

    /// The trip id this scope is pinned to, if any.
    pub fn trip_id(&self) -> Option<&TripId> {
        match self {
            ExpenseScope::AllTrips => None,
            ExpenseScope::Trip(id) => Some(id),
        }
    }
}

/// Expense-derived half of the aggregate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpenseTotals {
    pub total: f64,
    /// `"YYYY-MM"` → sum for that month.
    pub by_month: BTreeMap<String, f64>,
    /// Total restricted to the reference calendar year.
    pub reference_year_total: f64,
    /// Month buckets restricted to the reference calendar year.
    pub reference_year_by_month: BTreeMap<String, f64>,
}

/// Fold an expense snapshot into totals under the given scope.
///
/// Records with a non-finite amount are malformed: they contribute zero and
/// are logged, never aborting the whole recomputation.
pub fn aggregate_expenses(
    expenses: &[ExpenseRecord],
    scope: &ExpenseScope,
    reference_year: i32,
) -> ExpenseTotals {
    let mut totals = ExpenseTotals::default();
    for expense in expenses.iter().filter(|e| scope.matches(e)) {
        if !expense.amount.is_finite() {
            warn!(expense = %expense.id, "skipping expense with non-finite amount");
            continue;
        }
        let month = expense.created_at.month_key();
        totals.total += expense.amount;
        *totals.by_month.entry(month.clone()).or_insert(0.0) += expense.amount;
        if expense.created_at.year() == reference_year {
            totals.reference_year_total += expense.amount;
            *totals.reference_year_by_month.entry(month).or_insert(0.0) += expense.amount;
        }
    }
    totals
}
