//! Two-leg (cross-venue) opportunity detection.
//!
//! Consumes cached reserve snapshots, anchored to the same block where
//! possible, and emits sized candidates. Candidates carry their leg pool
//! sides copy-on-read so later stages re-price without touching the cache.

use alloy::primitives::{Address, U256, U512};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{gas_cost_in_quote, triangular};
use crate::config::{EngineConfig, MonitoredPair, TriangularCycle};
use crate::math;
use crate::pool::PairCache;
use crate::rpc::BlockHead;
use crate::types::{
    Freshness, Leg, LegPool, Opportunity, OpportunityKind, OpportunityStatus, PairKey,
    ReserveSnapshot, Token, VenueId, VenueRegistry,
};

/// Result of one detection pass.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub candidates: Vec<Opportunity>,
    /// Pairs whose reserves backed an emitted candidate; they are what we
    /// most want re-read next block.
    pub impacted: Vec<PairKey>,
    /// Venue combinations skipped because their snapshots mixed blocks
    /// beyond the allowed skew.
    pub stale_skipped: u64,
}

/// One venue's live view of a monitored pair.
struct PairView {
    venue: VenueId,
    key: PairKey,
    base_reserve: U256,
    quote_reserve: U256,
    block_number: u64,
}

pub struct Detector {
    pub(crate) venues: Arc<VenueRegistry>,
    pub(crate) tokens: Arc<HashMap<Address, Token>>,
    pub(crate) cache: Arc<PairCache>,
    pub(crate) pairs: Vec<MonitoredPair>,
    pub(crate) cycles: Vec<TriangularCycle>,
    pub(crate) engine: EngineConfig,
    pub(crate) native_token: Address,
    counter: AtomicU64,
}

impl Detector {
    pub fn new(
        venues: Arc<VenueRegistry>,
        tokens: Arc<HashMap<Address, Token>>,
        cache: Arc<PairCache>,
        pairs: Vec<MonitoredPair>,
        cycles: Vec<TriangularCycle>,
        engine: EngineConfig,
        native_token: Address,
    ) -> Self {
        Self {
            venues,
            tokens,
            cache,
            pairs,
            cycles,
            engine,
            native_token,
            counter: AtomicU64::new(0),
        }
    }

    /// Run one full detection pass against the cached snapshots. Iteration
    /// order is fixed (configuration order, then venue id order), so
    /// identical snapshots and configuration produce identical candidate
    /// ids in identical order.
    pub fn scan(&self, head: BlockHead, gas_price_wei: u128) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        self.scan_two_leg(head, gas_price_wei, &mut out);
        triangular::scan_cycles(self, head, gas_price_wei, &mut out);
        out
    }

    pub(crate) fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn usable_snapshot(&self, key: &PairKey) -> Option<ReserveSnapshot> {
        match self.cache.read(key) {
            Some((_, Freshness::Dead)) | None => None,
            Some((snapshot, _)) => Some(snapshot),
        }
    }

    fn scan_two_leg(&self, head: BlockHead, gas_price_wei: u128, out: &mut ScanOutcome) {
        for pair in &self.pairs {
            let Some(quote_token) = self.tokens.get(&pair.quote) else {
                continue;
            };
            let max_in = quote_token.usd_to_raw(pair.max_position_usd);
            if max_in.is_zero() {
                continue;
            }
            let gas_quote = gas_cost_in_quote(
                &self.tokens,
                self.native_token,
                pair.quote,
                OpportunityKind::TwoLeg,
                gas_price_wei,
                &self.engine,
            );

            let mut views = Vec::new();
            for venue in self.venues.ids() {
                let key = PairKey::new(venue, pair.base, pair.quote);
                let Some(snapshot) = self.usable_snapshot(&key) else {
                    continue;
                };
                let (Some(base_reserve), Some(quote_reserve)) = (
                    snapshot.reserve_of(pair.base),
                    snapshot.reserve_of(pair.quote),
                ) else {
                    continue;
                };
                views.push(PairView {
                    venue,
                    key,
                    base_reserve,
                    quote_reserve,
                    block_number: snapshot.block_number,
                });
            }

            for i in 0..views.len() {
                for j in (i + 1)..views.len() {
                    self.check_venue_pair(pair, &views[i], &views[j], max_in, gas_quote, head, out);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_venue_pair(
        &self,
        pair: &MonitoredPair,
        a: &PairView,
        b: &PairView,
        max_in: U256,
        gas_quote: U256,
        head: BlockHead,
        out: &mut ScanOutcome,
    ) {
        // Reserves from different blocks are usable only within the skew
        // window, measured from the run's block.
        let oldest = a.block_number.min(b.block_number);
        if head.number.saturating_sub(oldest) > self.engine.max_block_skew {
            out.stale_skipped += 1;
            return;
        }

        // Spot gap below the margin floor cannot survive qualification;
        // skip before any sizing work.
        if !math::price_gap_exceeds(
            (a.base_reserve, a.quote_reserve),
            (b.base_reserve, b.quote_reserve),
            self.engine.min_margin_ppm(),
        ) {
            return;
        }

        // Price of the base token in quote units, compared by
        // cross-multiplication: buy where the base is cheaper.
        let price_a = U512::from(a.quote_reserve) * U512::from(b.base_reserve);
        let price_b = U512::from(b.quote_reserve) * U512::from(a.base_reserve);
        let (buy, sell) = if price_a <= price_b { (a, b) } else { (b, a) };

        let buy_pool = LegPool {
            reserve_in: buy.quote_reserve,
            reserve_out: buy.base_reserve,
            fee: self.venues.get(buy.venue).fee,
        };
        let sell_pool = LegPool {
            reserve_in: sell.base_reserve,
            reserve_out: sell.quote_reserve,
            fee: self.venues.get(sell.venue).fee,
        };

        let Some(trade) = math::optimal_two_leg_size(buy_pool, sell_pool, max_in, gas_quote)
        else {
            return;
        };
        let hops = match math::amounts_out(trade.amount_in, &[buy_pool, sell_pool]) {
            Ok(hops) => hops,
            Err(e) => {
                // The sized amount came from the same pools; a failure here
                // is a math precondition bug, not market state.
                warn!(error = %e, "sized trade failed re-pricing; candidate discarded");
                return;
            }
        };
        let amount_out = hops[1];

        let legs = vec![
            Leg {
                venue: buy.venue,
                token_in: pair.quote,
                token_out: pair.base,
            },
            Leg {
                venue: sell.venue,
                token_in: pair.base,
                token_out: pair.quote,
            },
        ];
        let id = Opportunity::make_id(
            OpportunityKind::TwoLeg,
            &legs,
            head.number,
            self.next_counter(),
        );
        let created_at = Utc::now();

        debug!(
            %id,
            buy = self.venues.name(buy.venue),
            sell = self.venues.name(sell.venue),
            amount_in = %trade.amount_in,
            net_profit = %trade.net_profit,
            "two-leg candidate"
        );

        out.candidates.push(Opportunity {
            id,
            kind: OpportunityKind::TwoLeg,
            leg_pools: vec![buy_pool, sell_pool],
            trade_amount_in: trade.amount_in,
            quote_token: pair.quote,
            gross_profit_quote: amount_out.saturating_sub(trade.amount_in),
            net_profit_quote: trade.net_profit,
            gas_cost_quote: gas_quote,
            fee_cost_quote: super::fee_cost_in_quote(
                trade.amount_in,
                &[buy_pool.fee, sell_pool.fee],
            ),
            block_number: head.number,
            block_hash: head.hash,
            created_at,
            expires_at: created_at
                + ChronoDuration::seconds(self.engine.opportunity_timeout_secs as i64),
            status: OpportunityStatus::Detected,
            reason: None,
            legs,
        });
        out.impacted.push(buy.key);
        out.impacted.push(sell.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, RpcConfig};
    use crate::rpc::RpcPool;
    use crate::stats::Stats;
    use crate::types::{FeeRate, Venue};
    use alloy::primitives::{address, B256};

    const WETH: Address = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
    const USDC: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

    fn fixture() -> (Detector, Arc<PairCache>) {
        let venues = Arc::new(VenueRegistry::new(vec![
            Venue {
                name: "uniswap".into(),
                factory: Address::ZERO,
                fee: FeeRate::V2_DEFAULT,
            },
            Venue {
                name: "sushiswap".into(),
                factory: Address::ZERO,
                fee: FeeRate::V2_DEFAULT,
            },
        ]));
        let rpc = Arc::new(RpcPool::new(
            vec![EndpointConfig {
                url: "ws://127.0.0.1:1".into(),
                weight: 1,
                max_retries: 1,
                timeout_ms: 10,
            }],
            RpcConfig::default(),
            Arc::new(Stats::new()),
        ));
        let cache = Arc::new(PairCache::new(
            Arc::clone(&venues),
            rpc,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(5),
        ));
        let mut tokens = HashMap::new();
        tokens.insert(
            WETH,
            Token {
                address: WETH,
                symbol: "WETH".into(),
                decimals: 18,
                usd_price: 2000.0,
            },
        );
        tokens.insert(
            USDC,
            Token {
                address: USDC,
                symbol: "USDC".into(),
                decimals: 6,
                usd_price: 1.0,
            },
        );
        let detector = Detector::new(
            venues,
            Arc::new(tokens),
            Arc::clone(&cache),
            vec![MonitoredPair {
                base: WETH,
                quote: USDC,
                max_position_usd: 1_000_000.0,
            }],
            vec![],
            EngineConfig {
                min_margin: 0.005,
                max_block_skew: 1,
                ..EngineConfig::default()
            },
            WETH,
        );
        (detector, cache)
    }

    fn publish(cache: &PairCache, venue: u16, weth: u128, usdc: u128, block: u64) {
        let key = PairKey::new(VenueId(venue), WETH, USDC);
        let snapshot = ReserveSnapshot {
            pair: key,
            address: Address::ZERO,
            // USDC < WETH by raw bytes: USDC is token0.
            reserve0: U256::from(usdc),
            reserve1: U256::from(weth),
            block_number: block,
            block_hash: B256::ZERO,
            observed_at: Utc::now(),
        };
        cache.note_block(block);
        cache.publish(snapshot);
    }

    fn head(number: u64) -> BlockHead {
        BlockHead {
            number,
            hash: B256::ZERO,
        }
    }

    const WETH_1000: u128 = 1_000_000_000_000_000_000_000; // 1000e18
    const USDC_2M: u128 = 2_000_000_000_000; // 2,000,000e6
    const USDC_2_1M: u128 = 2_100_000_000_000; // 2,100,000e6

    #[test]
    fn symmetric_pools_yield_no_candidates() {
        let (detector, cache) = fixture();
        publish(&cache, 0, WETH_1000, USDC_2M, 100);
        publish(&cache, 1, WETH_1000, USDC_2M, 100);

        let outcome = detector.scan(head(100), 30_000_000_000);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.stale_skipped, 0);
    }

    #[test]
    fn clear_gap_emits_one_sized_candidate() {
        let (detector, cache) = fixture();
        publish(&cache, 0, WETH_1000, USDC_2M, 100); // $2000: cheap base, buy here
        publish(&cache, 1, WETH_1000, USDC_2_1M, 100); // $2100: sell here

        let outcome = detector.scan(head(100), 30_000_000_000);
        assert_eq!(outcome.candidates.len(), 1);

        let opp = &outcome.candidates[0];
        assert_eq!(opp.kind, OpportunityKind::TwoLeg);
        assert_eq!(opp.status, OpportunityStatus::Detected);
        assert_eq!(opp.legs[0].venue, VenueId(0)); // buy on the cheap venue
        assert_eq!(opp.legs[1].venue, VenueId(1));
        assert_eq!(opp.legs[0].token_in, USDC);
        assert!(opp.net_profit_quote > U256::ZERO);
        assert!(opp.trade_amount_in > U256::ZERO);
        assert!(opp.expires_at > opp.created_at);
        assert_eq!(outcome.impacted.len(), 2);
    }

    #[test]
    fn dead_pool_is_skipped_silently() {
        let (detector, cache) = fixture();
        publish(&cache, 0, WETH_1000, USDC_2M, 100);
        publish(&cache, 1, 0, USDC_2_1M, 100); // zero WETH reserve: dead

        let outcome = detector.scan(head(100), 30_000_000_000);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.stale_skipped, 0);
    }

    #[test]
    fn block_skew_boundary() {
        let (detector, cache) = fixture();
        publish(&cache, 0, WETH_1000, USDC_2M, 99); // one block behind
        publish(&cache, 1, WETH_1000, USDC_2_1M, 100);

        // Skew of exactly max_block_skew (1): accepted.
        let outcome = detector.scan(head(100), 30_000_000_000);
        assert_eq!(outcome.candidates.len(), 1);

        // One block beyond: rejected as stale.
        let outcome = detector.scan(head(101), 30_000_000_000);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.stale_skipped, 1);
    }

    #[test]
    fn determinism_of_candidate_ids() {
        let (detector_a, cache_a) = fixture();
        publish(&cache_a, 0, WETH_1000, USDC_2M, 100);
        publish(&cache_a, 1, WETH_1000, USDC_2_1M, 100);

        let (detector_b, cache_b) = fixture();
        publish(&cache_b, 0, WETH_1000, USDC_2M, 100);
        publish(&cache_b, 1, WETH_1000, USDC_2_1M, 100);

        let ids_a: Vec<String> = detector_a
            .scan(head(100), 30_000_000_000)
            .candidates
            .into_iter()
            .map(|o| o.id)
            .collect();
        let ids_b: Vec<String> = detector_b
            .scan(head(100), 30_000_000_000)
            .candidates
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids_a, ids_b);
    }
}
