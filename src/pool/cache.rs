//! Pair-address resolution and reserve snapshot cache.
//!
//! Thread-safe via DashMap: many concurrent readers, writes only from the
//! price feed (snapshots) and the resolver path (addresses). Snapshot
//! publication replaces the whole value, so a reader sees either the old or
//! the new snapshot, never a torn update.

use alloy::primitives::Address;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::RpcError;
use crate::rpc::RpcPool;
use crate::types::{Freshness, PairKey, ReserveSnapshot, VenueRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pair(Address),
    /// The factory returned the zero address. Cached with a shorter TTL so
    /// missing pools are not hammered every block.
    NoPair,
}

#[derive(Debug, Clone, Copy)]
struct AddressEntry {
    resolution: Resolution,
    resolved_at: Instant,
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    snapshot: ReserveSnapshot,
    /// Set when a refresh for this pair failed; the prior snapshot is
    /// retained but reads report it Stale.
    refresh_failed: bool,
}

pub struct PairCache {
    venues: Arc<VenueRegistry>,
    rpc: Arc<RpcPool>,
    addresses: DashMap<PairKey, AddressEntry>,
    snapshots: DashMap<PairKey, SnapshotEntry>,
    latest_block: AtomicU64,
    ttl: Duration,
    negative_ttl: Duration,
}

impl PairCache {
    pub fn new(
        venues: Arc<VenueRegistry>,
        rpc: Arc<RpcPool>,
        ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            venues,
            rpc,
            addresses: DashMap::new(),
            snapshots: DashMap::new(),
            latest_block: AtomicU64::new(0),
            ttl,
            negative_ttl,
        }
    }

    /// Resolve the pool address for a pair, consulting the factory on a
    /// cache miss. `Ok(None)` means the venue has no pool for this pair.
    pub async fn resolve(&self, key: PairKey) -> Result<Option<Address>, RpcError> {
        if let Some(entry) = self.addresses.get(&key) {
            let ttl = match entry.resolution {
                Resolution::Pair(_) => self.ttl,
                Resolution::NoPair => self.negative_ttl,
            };
            if entry.resolved_at.elapsed() < ttl {
                return Ok(match entry.resolution {
                    Resolution::Pair(address) => Some(address),
                    Resolution::NoPair => None,
                });
            }
        }

        let factory = self.venues.get(key.venue).factory;
        let address = self
            .rpc
            .get_pair_address(factory, key.token0, key.token1)
            .await?;

        let resolution = if address.is_zero() {
            debug!(pair = %key, "factory has no pool for pair");
            Resolution::NoPair
        } else {
            Resolution::Pair(address)
        };
        self.addresses.insert(
            key,
            AddressEntry {
                resolution,
                resolved_at: Instant::now(),
            },
        );

        Ok(match resolution {
            Resolution::Pair(address) => Some(address),
            Resolution::NoPair => None,
        })
    }

    /// Already-resolved address, ignoring TTL. Used by the refresh loop,
    /// which opportunistically re-resolves through `resolve` instead.
    pub fn cached_address(&self, key: &PairKey) -> Option<Address> {
        self.addresses.get(key).and_then(|e| match e.resolution {
            Resolution::Pair(address) => Some(address),
            Resolution::NoPair => None,
        })
    }

    /// Record the newest block number seen on the chain; staleness is judged
    /// against it.
    pub fn note_block(&self, number: u64) {
        self.latest_block.fetch_max(number, Ordering::Relaxed);
    }

    pub fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::Relaxed)
    }

    /// Publish a snapshot. A snapshot from an older block than the one
    /// already held is discarded; equal-block republish wins (it is newer
    /// in observation time).
    pub fn publish(&self, snapshot: ReserveSnapshot) {
        let key = snapshot.pair;
        match self.snapshots.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if held.get().snapshot.block_number <= snapshot.block_number {
                    held.insert(SnapshotEntry {
                        snapshot,
                        refresh_failed: false,
                    });
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SnapshotEntry {
                    snapshot,
                    refresh_failed: false,
                });
            }
        }
    }

    /// Flag the held snapshot after a failed refresh; it stays readable but
    /// reports Stale.
    pub fn mark_refresh_failed(&self, key: &PairKey) {
        if let Some(mut entry) = self.snapshots.get_mut(key) {
            entry.refresh_failed = true;
        }
    }

    /// Copy-on-read snapshot access with its freshness tag.
    pub fn read(&self, key: &PairKey) -> Option<(ReserveSnapshot, Freshness)> {
        let entry = self.snapshots.get(key)?;
        let snapshot = entry.snapshot.clone();

        let freshness = if snapshot.is_dead() {
            Freshness::Dead
        } else if entry.refresh_failed || self.is_past_ttl(&snapshot) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        };
        Some((snapshot, freshness))
    }

    /// True when the pair has no snapshot or its snapshot aged out.
    pub fn needs_refresh(&self, key: &PairKey) -> bool {
        match self.snapshots.get(key) {
            Some(entry) => entry.refresh_failed || self.is_past_ttl(&entry.snapshot),
            None => true,
        }
    }

    fn is_past_ttl(&self, snapshot: &ReserveSnapshot) -> bool {
        let age = Utc::now() - snapshot.observed_at;
        age.to_std().map_or(true, |age| age > self.ttl)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}
