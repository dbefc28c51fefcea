//! Durable opportunity store.
//!
//! The engine talks to an append-only sink; SQLite is the shipped
//! implementation. Transient unavailability is absorbed by `BufferedStore`:
//! failed writes buffer up to a limit (oldest dropped beyond it) and an
//! outage longer than the configured maximum escalates to the orchestrator.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{Opportunity, OpportunityStatus, ReserveSnapshot, VenueRegistry};

/// Flat row shape of the `opportunities` table. Big integers are decimal
/// strings; they exceed every SQLite integer type.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRecord {
    pub id: String,
    pub kind: String,
    pub pair_path: String,
    pub venue_path: String,
    pub trade_amount_in: String,
    pub gross_profit_quote: String,
    pub net_profit_quote: String,
    pub gas_cost_quote: String,
    pub fee_cost_quote: String,
    pub margin: f64,
    pub status: String,
    pub reason: Option<String>,
    pub block_number: u64,
    pub block_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OpportunityRecord {
    pub fn from_opportunity(opp: &Opportunity, venues: &VenueRegistry) -> Self {
        Self {
            id: opp.id.clone(),
            kind: opp.kind.to_string(),
            pair_path: opp.token_path(),
            venue_path: opp.venue_path(venues),
            trade_amount_in: opp.trade_amount_in.to_string(),
            gross_profit_quote: opp.gross_profit_quote.to_string(),
            net_profit_quote: opp.net_profit_quote.to_string(),
            gas_cost_quote: opp.gas_cost_quote.to_string(),
            fee_cost_quote: opp.fee_cost_quote.to_string(),
            margin: opp.margin(),
            status: opp.status.to_string(),
            reason: opp.reason.clone(),
            block_number: opp.block_number,
            block_hash: format!("{:#x}", opp.block_hash),
            created_at: opp.created_at,
            expires_at: opp.expires_at,
        }
    }
}

/// One `price_history` row.
#[derive(Debug, Clone, Serialize)]
pub struct PriceRow {
    pub pair: String,
    pub venue: String,
    pub reserve0: String,
    pub reserve1: String,
    pub block_number: u64,
    pub observed_at: DateTime<Utc>,
}

impl PriceRow {
    pub fn from_snapshot(snapshot: &ReserveSnapshot, venues: &VenueRegistry) -> Self {
        Self {
            pair: format!("{}/{}", snapshot.pair.token0, snapshot.pair.token1),
            venue: venues.name(snapshot.pair.venue).to_string(),
            reserve0: snapshot.reserve0.to_string(),
            reserve1: snapshot.reserve1.to_string(),
            block_number: snapshot.block_number,
            observed_at: snapshot.observed_at,
        }
    }
}

/// Filters for the `/opportunities` query surface.
#[derive(Debug, Clone, Default)]
pub struct OpportunityQuery {
    pub limit: Option<usize>,
    pub kind: Option<String>,
    pub min_profit: Option<f64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Filters for the `/prices` query surface.
#[derive(Debug, Clone, Default)]
pub struct PriceQuery {
    pub pair: Option<String>,
    pub venue: Option<String>,
    pub limit: Option<usize>,
}

/// Append-only opportunity sink plus the read surface the API needs.
/// Inserts are idempotent on `id`.
pub trait OpportunityStore: Send + Sync {
    fn insert(&self, record: &OpportunityRecord) -> Result<(), StoreError>;
    fn update_status(
        &self,
        id: &str,
        status: OpportunityStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;
    fn append_price(&self, row: &PriceRow) -> Result<(), StoreError>;
    fn query_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> Result<Vec<OpportunityRecord>, StoreError>;
    fn get_opportunity(&self, id: &str) -> Result<Option<OpportunityRecord>, StoreError>;
    fn query_prices(&self, query: &PriceQuery) -> Result<Vec<PriceRow>, StoreError>;
}

enum Pending {
    Opportunity(OpportunityRecord),
    Price(PriceRow),
}

/// Write-side wrapper that rides out store outages.
pub struct BufferedStore<S: OpportunityStore> {
    inner: S,
    buffer: Mutex<VecDeque<Pending>>,
    buffer_limit: usize,
    outage_since: Mutex<Option<Instant>>,
    dropped: std::sync::atomic::AtomicU64,
}

impl<S: OpportunityStore> BufferedStore<S> {
    pub fn new(inner: S, buffer_limit: usize) -> Self {
        Self {
            inner,
            buffer: Mutex::new(VecDeque::new()),
            buffer_limit,
            outage_since: Mutex::new(None),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn insert(&self, record: OpportunityRecord) {
        // Drain earlier backlog first so the store sees writes in order.
        self.flush();
        if let Err(e) = self.inner.insert(&record) {
            self.note_outage(&e);
            self.push(Pending::Opportunity(record));
        }
    }

    pub fn append_price(&self, row: PriceRow) {
        self.flush();
        if let Err(e) = self.inner.append_price(&row) {
            self.note_outage(&e);
            self.push(Pending::Price(row));
        }
    }

    /// Status transitions are telemetry; on failure they are dropped, not
    /// buffered.
    pub fn update_status(&self, id: &str, status: OpportunityStatus, reason: Option<&str>) {
        if let Err(e) = self.inner.update_status(id, status, reason) {
            debug!(%id, error = %e, "status update dropped");
        }
    }

    /// Retry the backlog. Clears the outage clock once everything drains.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(pending) = buffer.front() {
            let result = match pending {
                Pending::Opportunity(record) => self.inner.insert(record),
                Pending::Price(row) => self.inner.append_price(row),
            };
            match result {
                Ok(()) => {
                    buffer.pop_front();
                }
                Err(_) => return,
            }
        }
        *self.outage_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// How long the store has been continuously unavailable.
    pub fn outage_duration(&self) -> Option<Duration> {
        self.outage_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|since| since.elapsed())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn push(&self, pending: Pending) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= self.buffer_limit {
            buffer.pop_front();
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        buffer.push_back(pending);
    }

    fn note_outage(&self, error: &StoreError) {
        let mut since = self.outage_since.lock().unwrap_or_else(|e| e.into_inner());
        if since.is_none() {
            warn!(error = %error, "store unavailable; buffering writes");
            *since = Some(Instant::now());
        }
    }
}
