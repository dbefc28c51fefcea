//! Process lifecycle and the per-tick pipeline.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Starting brings
//! up RpcPool, PairCache and PriceFeed in that order; Stopping tears down in
//! reverse. Within a tick the pipeline is strictly serial:
//! refresh -> detect -> qualify -> gate -> emit, with at most one detection
//! pass in flight. A periodic timer backs up the block callback and is
//! skipped whenever a block-driven pass ran recently.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiState};
use crate::arbitrage::{Detector, Qualifier};
use crate::config::AppConfig;
use crate::pool::{FeedTick, PairCache, PriceFeed};
use crate::risk::{Portfolio, RiskGate};
use crate::rpc::{BlockHead, RpcPool};
use crate::sim::{ExecutionSimulator, SimulatedTrade};
use crate::stats::Stats;
use crate::store::{BufferedStore, OpportunityRecord, PriceRow, SqliteStore};
use crate::types::{OpportunityStatus, PairKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Why the run ended; the binary maps this to its exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Clean,
    /// The chain could not be reached at startup or the subscription was
    /// permanently lost.
    RpcOutage,
    /// The store stayed unavailable beyond the tolerated outage.
    StoreOutage,
    /// A background task died unexpectedly.
    TaskFailure(&'static str),
}

pub struct Orchestrator {
    config: AppConfig,
    stats: Arc<Stats>,
    store: Arc<BufferedStore<SqliteStore>>,
    state: Mutex<OrchestratorState>,
}

/// Everything one tick needs, wired once at startup.
struct Pipeline {
    rpc: Arc<RpcPool>,
    feed: Arc<PriceFeed>,
    detector: Detector,
    qualifier: Qualifier,
    gate: RiskGate,
    portfolio: Portfolio,
    sim_tx: mpsc::Sender<SimulatedTrade>,
    store: Arc<BufferedStore<SqliteStore>>,
    stats: Arc<Stats>,
    config: AppConfig,
    last_gas_price: Mutex<Option<u128>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, store: Arc<BufferedStore<SqliteStore>>, stats: Arc<Stats>) -> Self {
        Self {
            config,
            stats,
            store,
            state: Mutex::new(OrchestratorState::Stopped),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: OrchestratorState) {
        info!(?state, "orchestrator state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run until `shutdown` flips or a fatal condition forces Stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        self.set_state(OrchestratorState::Starting);

        let rpc = Arc::new(RpcPool::new(
            self.config.endpoints.clone(),
            self.config.rpc.clone(),
            Arc::clone(&self.stats),
        ));

        // Startup connectivity probe; an unreachable chain is fatal here.
        match rpc.get_block_number().await {
            Ok(number) => info!(block = number, "chain reachable"),
            Err(e) => {
                error!(error = %e, "chain unreachable at startup");
                self.set_state(OrchestratorState::Stopped);
                return ExitReason::RpcOutage;
            }
        }

        let venues = Arc::new(self.config.venues.clone());
        let tokens = Arc::new(self.config.tokens.clone());
        let cache = Arc::new(PairCache::new(
            Arc::clone(&venues),
            Arc::clone(&rpc),
            self.config.engine.cache_ttl(),
            std::time::Duration::from_secs(self.config.engine.negative_cache_ttl_secs),
        ));

        let (feed, mut tick_rx) = PriceFeed::new(
            Arc::clone(&rpc),
            Arc::clone(&cache),
            monitored_universe(&self.config),
            self.config.engine.batch_size,
            self.config.engine.stagger_delay(),
            std::time::Duration::from_millis(self.config.rpc.resubscribe_delay_ms),
        );
        let feed = Arc::new(feed);

        let detector = Detector::new(
            Arc::clone(&venues),
            Arc::clone(&tokens),
            Arc::clone(&cache),
            self.config.pairs.clone(),
            self.config.cycles.clone(),
            self.config.engine.clone(),
            self.config.native_token,
        );
        let qualifier = Qualifier::new(
            Arc::clone(&tokens),
            self.config.engine.clone(),
            self.config.native_token,
        );
        let portfolio = Portfolio::new(
            self.config.risk.available_capital_usd,
            self.config.risk.daily_reset_hour_utc,
        );
        let gate = RiskGate::new(
            Arc::clone(&tokens),
            self.config.risk.clone(),
            self.config.engine.clone(),
            portfolio.clone(),
        );

        let (sim_tx, sim_rx) = mpsc::channel(64);
        let simulator = ExecutionSimulator::new(
            portfolio.clone(),
            Arc::clone(&self.store),
            Arc::clone(&tokens),
            Arc::clone(&self.stats),
        );

        // Internal stop signal for background tasks; forwarded from the
        // external shutdown or flipped on a fatal condition.
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<&'static str> = JoinSet::new();

        {
            let feed = Arc::clone(&feed);
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                feed.run(stop).await;
                "price-feed"
            });
        }
        {
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                simulator.run(sim_rx, stop).await;
                "simulator"
            });
        }
        if self.config.api.enabled {
            let state = ApiState {
                store: Arc::clone(&self.store),
                stats: Arc::clone(&self.stats),
                unhealthy_after: std::time::Duration::from_secs(
                    self.config.rpc.unhealthy_after_secs,
                ),
            };
            let listen = self.config.api.listen.clone();
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                if let Err(e) = api::serve(state, &listen, stop).await {
                    error!(error = %e, "read api failed");
                }
                "read-api"
            });
        }

        let pipeline = Pipeline {
            rpc,
            feed,
            detector,
            qualifier,
            gate,
            portfolio,
            sim_tx,
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            config: self.config.clone(),
            last_gas_price: Mutex::new(None),
        };

        self.set_state(OrchestratorState::Running);
        let reason = self
            .run_loop(&pipeline, &mut tick_rx, &mut shutdown, &mut tasks)
            .await;

        self.set_state(OrchestratorState::Stopping);
        let _ = stop_tx.send(true);

        let grace = self.config.engine.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "shutdown grace exceeded; aborting tasks");
            tasks.abort_all();
        }

        self.store.flush();
        self.set_state(OrchestratorState::Stopped);
        reason
    }

    async fn run_loop(
        &self,
        pipeline: &Pipeline,
        tick_rx: &mut mpsc::Receiver<FeedTick>,
        shutdown: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<&'static str>,
    ) -> ExitReason {
        let mut interval = tokio::time::interval(self.config.engine.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_block_run = Instant::now();
        let mut last_head: Option<BlockHead> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return ExitReason::Clean,

                ended = tasks.join_next() => {
                    let name = match ended {
                        Some(Ok(name)) => name,
                        Some(Err(join_error)) => {
                            error!(error = %join_error, "background task panicked");
                            return ExitReason::TaskFailure("panicked");
                        }
                        None => continue,
                    };
                    error!(task = name, "background task ended unexpectedly");
                    return ExitReason::TaskFailure(name);
                }

                tick = tick_rx.recv() => match tick {
                    Some(FeedTick { head, refreshed }) => {
                        last_head = Some(head);
                        last_block_run = Instant::now();
                        if let Some(reason) = pipeline.process_tick(head, Some(refreshed)).await {
                            return reason;
                        }
                    }
                    None => {
                        error!("price feed channel closed");
                        return ExitReason::RpcOutage;
                    }
                },

                _ = interval.tick() => {
                    // Backup cadence only; skip when blocks are flowing.
                    if last_block_run.elapsed() < self.config.engine.scan_interval() {
                        continue;
                    }
                    let Some(head) = last_head else { continue };
                    debug!(block = head.number, "periodic detection pass");
                    if let Some(reason) = pipeline.process_tick(head, None).await {
                        return reason;
                    }
                }
            }
        }
    }
}

impl Pipeline {
    /// One serial pass: refresh bookkeeping, detect, qualify, gate, emit.
    /// Returns `Some` when a fatal condition must stop the orchestrator.
    async fn process_tick(
        &self,
        head: BlockHead,
        refreshed: Option<Vec<crate::types::ReserveSnapshot>>,
    ) -> Option<ExitReason> {
        self.stats.ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats.record_block(head.number);
        self.portfolio.maybe_reset_daily().await;

        if self.config.store.record_price_history {
            if let Some(snapshots) = &refreshed {
                for snapshot in snapshots {
                    self.store
                        .append_price(PriceRow::from_snapshot(snapshot, &self.config.venues));
                }
            }
        }

        let gas_price = match self.rpc.get_gas_price().await {
            Ok(price) => {
                *self
                    .last_gas_price
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(price);
                price
            }
            Err(e) => {
                let held = *self
                    .last_gas_price
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match held {
                    Some(price) => {
                        debug!(error = %e, "gas price fetch failed; reusing last");
                        price
                    }
                    None => {
                        warn!(error = %e, "gas price unknown; skipping tick");
                        return self.check_store_outage();
                    }
                }
            }
        };

        self.detect_and_emit(head, gas_price).await;
        self.check_store_outage()
    }

    /// Detection through emission at a known gas price.
    async fn detect_and_emit(&self, head: BlockHead, gas_price_wei: u128) {
        let engine = &self.config.engine;

        // Gas above the ceiling skips the whole pass for this tick.
        let max_gas_wei = engine.max_gas_price_gwei as u128 * 1_000_000_000;
        if gas_price_wei > max_gas_wei {
            self.stats
                .ticks_skipped_high_gas
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(gas_price_wei, "gas above ceiling; tick skipped");
            return;
        }

        let outcome = self.detector.scan(head, gas_price_wei);
        self.stats
            .stale_skipped
            .fetch_add(outcome.stale_skipped, std::sync::atomic::Ordering::Relaxed);
        for candidate in &outcome.candidates {
            self.stats.record_detected(candidate.kind);
        }
        for key in outcome.impacted {
            self.feed.mark_impacted(key);
        }

        let mut qualified = Vec::new();
        let mut rejected = Vec::new();
        for candidate in outcome.candidates {
            let opp = self.qualifier.qualify(candidate, gas_price_wei);
            match opp.status {
                OpportunityStatus::Qualified => qualified.push(opp),
                _ => {
                    self.stats
                        .rejected
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    rejected.push(opp);
                }
            }
        }

        // Emission cap, best margins first.
        qualified.sort_by(|a, b| {
            b.margin()
                .partial_cmp(&a.margin())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let backpressured = self.store.buffered() > 0;
        let mut cap = engine.max_opportunities_per_block;
        if backpressured && cap > 1 {
            // Under store pressure, shed all but the best qualified record.
            self.stats.dropped_qualified.fetch_add(
                qualified.len().saturating_sub(1) as u64,
                std::sync::atomic::Ordering::Relaxed,
            );
            cap = 1;
        }

        for opp in qualified.into_iter().take(cap) {
            let net_usd = self
                .config
                .token(opp.quote_token)
                .map(|t| t.raw_to_usd(opp.net_profit_quote))
                .unwrap_or(0.0);
            self.stats.record_qualified(opp.kind, net_usd);
            for leg in &opp.legs {
                self.stats.record_venue(self.config.venues.name(leg.venue));
            }

            self.store
                .insert(OpportunityRecord::from_opportunity(&opp, &self.config.venues));

            let assessment = self.gate.assess(&opp).await;
            if assessment.approved {
                self.stats
                    .approved
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let (Some(leg), Some(quote)) =
                    (opp.legs.first(), self.config.token(opp.quote_token))
                {
                    self.portfolio
                        .open_position(leg.venue, quote.raw_to_usd(assessment.sized_amount))
                        .await;
                }
                let trade = SimulatedTrade {
                    sized_amount: assessment.sized_amount,
                    opportunity: opp,
                };
                if self.sim_tx.send(trade).await.is_err() {
                    warn!("simulator channel closed; approved trade dropped");
                }
            } else if assessment
                .reasons
                .iter()
                .any(|r| r == crate::arbitrage::qualifier::reason::EXPIRED)
            {
                self.stats
                    .expired
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.store
                    .update_status(&opp.id, OpportunityStatus::Expired, None);
            } else {
                debug!(id = %opp.id, reasons = ?assessment.reasons, "gate veto");
                self.store.update_status(
                    &opp.id,
                    OpportunityStatus::Rejected,
                    Some(&assessment.reasons.join(",")),
                );
            }
        }

        if engine.emit_rejected {
            if backpressured {
                // Rejected records are the first to go under pressure.
                self.stats.dropped_rejected.fetch_add(
                    rejected.len() as u64,
                    std::sync::atomic::Ordering::Relaxed,
                );
            } else {
                rejected.sort_by(|a, b| {
                    b.margin()
                        .partial_cmp(&a.margin())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for opp in rejected {
                    self.store
                        .insert(OpportunityRecord::from_opportunity(&opp, &self.config.venues));
                }
            }
        }
    }

    fn check_store_outage(&self) -> Option<ExitReason> {
        match self.store.outage_duration() {
            Some(outage) if outage > self.config.store.outage_max() => {
                error!(?outage, "store outage beyond tolerance; stopping");
                Some(ExitReason::StoreOutage)
            }
            _ => None,
        }
    }
}

/// The monitored pair universe: every configured pair and every cycle leg,
/// across every venue, in deterministic configuration order.
pub fn monitored_universe(config: &AppConfig) -> Vec<PairKey> {
    let mut keys = Vec::new();
    let mut push = |key: PairKey| {
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    for venue in config.venues.ids() {
        for pair in &config.pairs {
            push(PairKey::new(venue, pair.base, pair.quote));
        }
        for cycle in &config.cycles {
            let [a, b, c] = cycle.tokens;
            push(PairKey::new(venue, a, b));
            push(PairKey::new(venue, b, c));
            push(PairKey::new(venue, c, a));
        }
    }
    keys
}
