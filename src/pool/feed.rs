//! Block-driven reserve refresh.
//!
//! One feed per process. The subscription state machine is
//! `Idle -> Subscribing -> Running`; a transport drop sends it back to
//! `Subscribing`, where the pool has already rotated endpoints. Block
//! events coalesce to depth one: while a refresh is running, newer blocks
//! overwrite the queued head so only the latest is processed next, and two
//! refreshes never run concurrently.

use chrono::Utc;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pool::PairCache;
use crate::rpc::{BlockHead, RpcPool};
use crate::types::{PairKey, ReserveSnapshot};

/// Outcome of one refresh pass, handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct FeedTick {
    pub head: BlockHead,
    /// Snapshots actually re-read this pass (price-history source).
    pub refreshed: Vec<ReserveSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Subscribing,
    Running,
}

pub struct PriceFeed {
    rpc: Arc<RpcPool>,
    cache: Arc<PairCache>,
    /// Full monitored universe, in deterministic configuration order.
    monitored: Vec<PairKey>,
    batch_size: usize,
    stagger_delay: Duration,
    resubscribe_delay: Duration,
    impacted: Mutex<HashSet<PairKey>>,
    /// Set once anyone calls `mark_impacted`; until then the feed refreshes
    /// the whole monitored set every block.
    signals_seen: AtomicBool,
    cold: AtomicBool,
    state: Mutex<FeedState>,
    tick_tx: mpsc::Sender<FeedTick>,
}

impl PriceFeed {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<RpcPool>,
        cache: Arc<PairCache>,
        monitored: Vec<PairKey>,
        batch_size: usize,
        stagger_delay: Duration,
        resubscribe_delay: Duration,
    ) -> (Self, mpsc::Receiver<FeedTick>) {
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let feed = Self {
            rpc,
            cache,
            monitored,
            batch_size: batch_size.max(1),
            stagger_delay,
            resubscribe_delay,
            impacted: Mutex::new(HashSet::new()),
            signals_seen: AtomicBool::new(false),
            cold: AtomicBool::new(true),
            state: Mutex::new(FeedState::Idle),
            tick_tx,
        };
        (feed, tick_rx)
    }

    pub fn state(&self) -> FeedState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: FeedState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// External signal that a pair's reserves are believed changed and must
    /// be re-read next block.
    pub fn mark_impacted(&self, pair: PairKey) {
        self.signals_seen.store(true, Ordering::Relaxed);
        self.impacted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pair);
    }

    /// Drive the feed until `shutdown` flips. Owns subscription recovery:
    /// on stream loss the rpc pool has rotated, so this simply resubscribes
    /// after `resubscribe_delay`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(FeedState::Subscribing);

            match self.rpc.subscribe_blocks().await {
                Ok(stream) => {
                    self.set_state(FeedState::Running);
                    if self.pump(stream, &mut shutdown).await {
                        break;
                    }
                    warn!("block subscription lost; resubscribing");
                }
                Err(e) => {
                    warn!(error = %e, "block subscription failed; retrying");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.resubscribe_delay) => {}
                    }
                }
            }
        }
        self.set_state(FeedState::Idle);
        info!("price feed stopped");
    }

    /// Process one subscription stream. Returns true on shutdown, false
    /// when the transport dropped.
    async fn pump(
        &self,
        mut stream: impl Stream<Item = BlockHead> + Send + Unpin,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut pending: Option<BlockHead> = None;

        loop {
            let head = match pending.take() {
                Some(head) => head,
                None => tokio::select! {
                    _ = shutdown.changed() => return true,
                    item = stream.next() => match item {
                        Some(head) => head,
                        None => return false,
                    },
                },
            };

            debug!(block = head.number, "refresh pass starting");
            let refreshed = self.refresh(head, shutdown).await;
            if *shutdown.borrow() {
                return true;
            }

            if self
                .tick_tx
                .send(FeedTick { head, refreshed })
                .await
                .is_err()
            {
                // Orchestrator is gone; nothing left to feed.
                return true;
            }

            // Coalesce whatever arrived while refreshing: keep only the
            // newest queued head.
            while let Some(Some(newer)) = stream.next().now_or_never() {
                pending = Some(newer);
            }
        }
    }

    /// Compute the impacted set and re-read it in staggered batches.
    async fn refresh(
        &self,
        head: BlockHead,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ReserveSnapshot> {
        self.cache.note_block(head.number);

        let targets = self.refresh_targets();
        let mut refreshed = Vec::with_capacity(targets.len());

        let mut first_batch = true;
        for chunk in targets.chunks(self.batch_size) {
            if *shutdown.borrow() {
                break;
            }
            if !first_batch {
                tokio::time::sleep(self.stagger_delay).await;
            }
            first_batch = false;

            // Resolve addresses up front; unresolvable pairs drop out of
            // this pass.
            let mut keys = Vec::with_capacity(chunk.len());
            let mut addresses = Vec::with_capacity(chunk.len());
            for key in chunk {
                match self.cache.resolve(*key).await {
                    Ok(Some(address)) => {
                        keys.push(*key);
                        addresses.push(address);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(pair = %key, error = %e, "pair resolution failed");
                        self.cache.mark_refresh_failed(key);
                    }
                }
            }
            if addresses.is_empty() {
                continue;
            }

            let mut results = self.rpc.get_reserves_batch(&addresses, head.number).await;

            // Whole-batch failure: fall back to one more individual pass
            // per pair before flagging anything stale.
            if results.iter().all(|r| r.is_err()) {
                debug!(batch = addresses.len(), "batch refresh failed; retrying per pair");
                let mut retried = Vec::with_capacity(addresses.len());
                for address in &addresses {
                    retried.push(self.rpc.get_reserves(*address, head.number).await);
                }
                results = retried;
            }

            for ((key, address), result) in keys.iter().zip(&addresses).zip(results) {
                match result {
                    Ok((reserve0, reserve1)) => {
                        let snapshot = ReserveSnapshot {
                            pair: *key,
                            address: *address,
                            reserve0,
                            reserve1,
                            block_number: head.number,
                            block_hash: head.hash,
                            observed_at: Utc::now(),
                        };
                        self.cache.publish(snapshot.clone());
                        refreshed.push(snapshot);
                    }
                    Err(e) => {
                        debug!(pair = %key, error = %e, "reserve refresh failed; snapshot stale");
                        self.cache.mark_refresh_failed(key);
                    }
                }
            }
        }

        if !refreshed.is_empty() {
            self.cold.store(false, Ordering::Relaxed);
        }
        refreshed
    }

    /// Impacted ∪ TTL-expired; the full monitored set on a cold start or
    /// when no external impact signals exist.
    fn refresh_targets(&self) -> Vec<PairKey> {
        let cold = self.cold.load(Ordering::Relaxed);
        let signals = self.signals_seen.load(Ordering::Relaxed);
        if cold || !signals {
            return self.monitored.clone();
        }

        let impacted: HashSet<PairKey> = self
            .impacted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        self.monitored
            .iter()
            .filter(|key| impacted.contains(key) || self.cache.needs_refresh(key))
            .copied()
            .collect()
    }
}
