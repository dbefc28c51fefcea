//! Process-wide counters backing `/statistics` and `/health`.
//!
//! Everything is lock-free or behind a tiny mutex; the hot path only touches
//! atomics. Statistics always reflect the last completed tick.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::OpportunityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Default)]
pub struct Stats {
    started_at: Mutex<Option<DateTime<Utc>>>,

    pub ticks: AtomicU64,
    pub ticks_skipped_high_gas: AtomicU64,
    /// Venue combinations the detector skipped on block skew. These never
    /// become candidates, so they are not rejections.
    pub stale_skipped: AtomicU64,

    detected_two_leg: AtomicU64,
    detected_triangular: AtomicU64,
    qualified_two_leg: AtomicU64,
    qualified_triangular: AtomicU64,
    pub rejected: AtomicU64,
    pub approved: AtomicU64,
    pub expired: AtomicU64,
    pub simulated_executed: AtomicU64,

    /// Emissions dropped under backpressure, by prior status.
    pub dropped_rejected: AtomicU64,
    pub dropped_qualified: AtomicU64,

    per_venue: DashMap<String, u64>,
    cumulative_net_profit_usd: Mutex<f64>,

    pub last_block_number: AtomicU64,
    last_block_at_unix_ms: AtomicI64,

    pub endpoint_index: AtomicUsize,
    pub endpoint_errors: AtomicU64,
    last_endpoint_error_unix_ms: AtomicI64,
}

impl Stats {
    pub fn new() -> Self {
        let stats = Self::default();
        *stats.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        stats
    }

    pub fn record_detected(&self, kind: OpportunityKind) {
        match kind {
            OpportunityKind::TwoLeg => self.detected_two_leg.fetch_add(1, Ordering::Relaxed),
            OpportunityKind::Triangular => {
                self.detected_triangular.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn record_qualified(&self, kind: OpportunityKind, net_profit_usd: f64) {
        match kind {
            OpportunityKind::TwoLeg => self.qualified_two_leg.fetch_add(1, Ordering::Relaxed),
            OpportunityKind::Triangular => {
                self.qualified_triangular.fetch_add(1, Ordering::Relaxed)
            }
        };
        let mut total = self
            .cumulative_net_profit_usd
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *total += net_profit_usd;
    }

    pub fn record_venue(&self, venue: &str) {
        *self.per_venue.entry(venue.to_string()).or_insert(0) += 1;
    }

    pub fn record_block(&self, number: u64) {
        self.last_block_number.store(number, Ordering::Relaxed);
        self.last_block_at_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_endpoint_error(&self, index: usize) {
        let _ = index;
        self.endpoint_errors.fetch_add(1, Ordering::Relaxed);
        self.last_endpoint_error_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_endpoint_index(&self, index: usize) {
        self.endpoint_index.store(index, Ordering::Relaxed);
    }

    pub fn last_block_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_block_at_unix_ms.load(Ordering::Relaxed);
        (ms != 0).then(|| DateTime::from_timestamp_millis(ms)).flatten()
    }

    pub fn last_endpoint_error_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_endpoint_error_unix_ms.load(Ordering::Relaxed);
        (ms != 0).then(|| DateTime::from_timestamp_millis(ms)).flatten()
    }

    pub fn uptime(&self) -> Duration {
        let started = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(Utc::now);
        (Utc::now() - started).to_std().unwrap_or_default()
    }

    pub fn cumulative_net_profit_usd(&self) -> f64 {
        *self
            .cumulative_net_profit_usd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Degraded when any endpoint failed within the last minute; unhealthy
    /// when the last block observation is older than `unhealthy_after`.
    pub fn health(&self, unhealthy_after: Duration) -> HealthStatus {
        let now = Utc::now();
        if let Some(seen) = self.last_block_at() {
            if (now - seen).to_std().unwrap_or_default() > unhealthy_after {
                return HealthStatus::Unhealthy;
            }
        } else {
            // Nothing observed yet; during startup grace report degraded
            // rather than flapping to unhealthy.
            return HealthStatus::Degraded;
        }
        if let Some(err_at) = self.last_endpoint_error_at() {
            if (now - err_at).to_std().unwrap_or_default() < Duration::from_secs(60) {
                return HealthStatus::Degraded;
            }
        }
        HealthStatus::Healthy
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_skipped_high_gas: self.ticks_skipped_high_gas.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            detected_two_leg: self.detected_two_leg.load(Ordering::Relaxed),
            detected_triangular: self.detected_triangular.load(Ordering::Relaxed),
            qualified_two_leg: self.qualified_two_leg.load(Ordering::Relaxed),
            qualified_triangular: self.qualified_triangular.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            simulated_executed: self.simulated_executed.load(Ordering::Relaxed),
            dropped_rejected: self.dropped_rejected.load(Ordering::Relaxed),
            dropped_qualified: self.dropped_qualified.load(Ordering::Relaxed),
            cumulative_net_profit_usd: self.cumulative_net_profit_usd(),
            per_venue: self
                .per_venue
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            last_block_number: self.last_block_number.load(Ordering::Relaxed),
            last_block_at: self.last_block_at(),
            endpoint_index: self.endpoint_index.load(Ordering::Relaxed),
            endpoint_errors: self.endpoint_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view serialized by `/statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub ticks: u64,
    pub ticks_skipped_high_gas: u64,
    pub stale_skipped: u64,
    pub detected_two_leg: u64,
    pub detected_triangular: u64,
    pub qualified_two_leg: u64,
    pub qualified_triangular: u64,
    pub rejected: u64,
    pub approved: u64,
    pub expired: u64,
    pub simulated_executed: u64,
    pub dropped_rejected: u64,
    pub dropped_qualified: u64,
    pub cumulative_net_profit_usd: f64,
    pub per_venue: std::collections::BTreeMap<String, u64>,
    pub last_block_number: u64,
    pub last_block_at: Option<DateTime<Utc>>,
    pub endpoint_index: usize,
    pub endpoint_errors: u64,
}
