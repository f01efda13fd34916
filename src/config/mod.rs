// SPDX-License-Identifier: MIT
//! Engine configuration loaded from an optional TOML file.
//!
//! Every field has a default so an absent file, an empty file, or a file with
//! only some sections all produce a working config. Environment variables
//! override the file for the handful of fields operators actually tune.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ─── ReconcileConfig ─────────────────────────────────────────────────────────

/// Orphan reconciliation settings (`[reconcile]` in engine.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Run the orphan reconciler alongside the statistics loop. Default: true.
    pub enabled: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ─── EngineConfig ────────────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Calendar year the "reference year" counters are restricted to.
    /// Default: the current UTC year.
    pub reference_year: i32,
    /// Capacity of the snapshot broadcast channel and the per-feed
    /// subscription channels. Lagging consumers lose the oldest snapshots
    /// first (last-write-wins). Default: 64.
    pub channel_capacity: usize,
    /// Orphan reconciliation settings.
    pub reconcile: ReconcileConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_year: Utc::now().year(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    ///
    /// A file that exists but fails to parse is ignored with a warning —
    /// a typo in engine.toml must not keep the engine from starting.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = path
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|contents| match toml::from_str::<Self>(&contents) {
                Ok(c) => Some(c),
                Err(err) => {
                    warn!(%err, "engine.toml failed to parse, using defaults");
                    None
                }
            })
            .unwrap_or_default();

        if let Some(year) = std::env::var("TRIPTALLY_REFERENCE_YEAR")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
        {
            config.reference_year = year;
        }

        if config.channel_capacity == 0 {
            warn!("channel_capacity 0 is invalid, using default");
            config.channel_capacity = DEFAULT_CHANNEL_CAPACITY;
        }

        config
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
