//! Triangular (three-leg) cycle detection.
//!
//! For every configured cycle the scan tries both traversal directions and
//! every venue assignment that uses at least two distinct venues. Sizing is
//! the coarse-geometric-probe + ternary-search primitive. Overlapping
//! winners on the same three pools collapse to one: largest net profit,
//! then smallest input, then lexicographically smallest venue path.

use alloy::primitives::{Address, U256};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use super::detector::{Detector, ScanOutcome};
use super::gas_cost_in_quote;
use crate::math;
use crate::rpc::BlockHead;
use crate::types::{Leg, LegPool, Opportunity, OpportunityKind, OpportunityStatus, PairKey};

pub(super) fn scan_cycles(
    det: &Detector,
    head: BlockHead,
    gas_price_wei: u128,
    out: &mut ScanOutcome,
) {
    for cycle in &det.cycles {
        let quote = cycle.tokens[0];
        let Some(quote_token) = det.tokens.get(&quote) else {
            continue;
        };
        let max_in = quote_token.usd_to_raw(cycle.max_position_usd);
        if max_in.is_zero() {
            continue;
        }
        let gas_quote = gas_cost_in_quote(
            &det.tokens,
            det.native_token,
            quote,
            OpportunityKind::Triangular,
            gas_price_wei,
            &det.engine,
        );

        let [a, b, c] = cycle.tokens;
        let orders: [[Address; 4]; 2] = [[a, b, c, a], [a, c, b, a]];

        // Winners per pool-set, folded with the overlap tie-break. A Vec is
        // plenty: a cycle touches at most venues^3 pool sets.
        let mut winners: Vec<(Vec<PairKey>, Opportunity, Vec<PairKey>)> = Vec::new();

        for order in &orders {
            for v1 in det.venues.ids() {
                for v2 in det.venues.ids() {
                    for v3 in det.venues.ids() {
                        if v1 == v2 && v2 == v3 {
                            continue; // needs at least two distinct venues
                        }
                        let Some((opportunity, keys)) = evaluate(
                            det,
                            order,
                            [v1, v2, v3],
                            max_in,
                            gas_quote,
                            head,
                            &mut out.stale_skipped,
                        ) else {
                            continue;
                        };

                        let mut pool_set = keys.clone();
                        pool_set.sort();

                        match winners.iter_mut().find(|(set, _, _)| *set == pool_set) {
                            Some((_, held, held_keys)) => {
                                if beats(&opportunity, held, det) {
                                    *held = opportunity;
                                    *held_keys = keys;
                                }
                            }
                            None => winners.push((pool_set, opportunity, keys)),
                        }
                    }
                }
            }
        }

        for (_, opportunity, keys) in winners {
            debug!(
                id = %opportunity.id,
                net_profit = %opportunity.net_profit_quote,
                "triangular candidate"
            );
            out.impacted.extend(keys);
            out.candidates.push(opportunity);
        }
    }
}

/// Overlap tie-break: net profit desc, then input amount asc, then venue
/// path lexicographic asc.
fn beats(challenger: &Opportunity, holder: &Opportunity, det: &Detector) -> bool {
    if challenger.net_profit_quote != holder.net_profit_quote {
        return challenger.net_profit_quote > holder.net_profit_quote;
    }
    if challenger.trade_amount_in != holder.trade_amount_in {
        return challenger.trade_amount_in < holder.trade_amount_in;
    }
    challenger.venue_path(&det.venues) < holder.venue_path(&det.venues)
}

fn evaluate(
    det: &Detector,
    token_path: &[Address; 4],
    venues: [crate::types::VenueId; 3],
    max_in: U256,
    gas_quote: U256,
    head: BlockHead,
    stale_skipped: &mut u64,
) -> Option<(Opportunity, Vec<PairKey>)> {
    let mut keys = Vec::with_capacity(3);
    let mut pools = Vec::with_capacity(3);
    let mut legs = Vec::with_capacity(3);
    let mut oldest = u64::MAX;

    for i in 0..3 {
        let token_in = token_path[i];
        let token_out = token_path[i + 1];
        let key = PairKey::new(venues[i], token_in, token_out);
        let snapshot = det.usable_snapshot(&key)?;
        let (reserve_in, reserve_out) = snapshot.oriented(token_in)?;

        oldest = oldest.min(snapshot.block_number);
        keys.push(key);
        pools.push(LegPool {
            reserve_in,
            reserve_out,
            fee: det.venues.get(venues[i]).fee,
        });
        legs.push(Leg {
            venue: venues[i],
            token_in,
            token_out,
        });
    }

    if head.number.saturating_sub(oldest) > det.engine.max_block_skew {
        *stale_skipped += 1;
        return None;
    }

    let trade = math::optimal_cycle_size(&pools, max_in, gas_quote)?;
    let hops = math::amounts_out(trade.amount_in, &pools).ok()?;
    let amount_out = *hops.last()?;

    let id = Opportunity::make_id(
        OpportunityKind::Triangular,
        &legs,
        head.number,
        det.next_counter(),
    );
    let created_at = Utc::now();
    let fees: Vec<_> = pools.iter().map(|p| p.fee).collect();

    let opportunity = Opportunity {
        id,
        kind: OpportunityKind::Triangular,
        trade_amount_in: trade.amount_in,
        quote_token: token_path[0],
        gross_profit_quote: amount_out.saturating_sub(trade.amount_in),
        net_profit_quote: trade.net_profit,
        gas_cost_quote: gas_quote,
        fee_cost_quote: super::fee_cost_in_quote(trade.amount_in, &fees),
        block_number: head.number,
        block_hash: head.hash,
        created_at,
        expires_at: created_at
            + ChronoDuration::seconds(det.engine.opportunity_timeout_secs as i64),
        status: OpportunityStatus::Detected,
        reason: None,
        legs,
        leg_pools: pools,
    };
    Some((opportunity, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, EngineConfig, RpcConfig, TriangularCycle};
    use crate::pool::PairCache;
    use crate::rpc::RpcPool;
    use crate::stats::Stats;
    use crate::types::{
        FeeRate, ReserveSnapshot, Token, Venue, VenueId, VenueRegistry,
    };
    use alloy::primitives::{address, B256};
    use std::collections::HashMap;
    use std::sync::Arc;

    const WETH: Address = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
    const USDC: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");
    const USDT: Address = address!("c2132D05D31c914a87C6611C10748AEb04B58e8F");

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
        for (addr, symbol, decimals, usd) in [
            (WETH, "WETH", 18u8, 2000.0),
            (USDC, "USDC", 6, 1.0),
            (USDT, "USDT", 6, 1.0),
        ] {
            tokens.insert(
                addr,
                Token {
                    address: addr,
                    symbol: symbol.into(),
                    decimals,
                    usd_price: usd,
                },
            );
        }
        let detector = Detector::new(
            venues,
            Arc::new(tokens),
            Arc::clone(&cache),
            vec![],
            vec![TriangularCycle {
                tokens: [WETH, USDC, USDT],
                max_position_usd: 100_000.0,
            }],
            EngineConfig {
                max_block_skew: 1,
                ..EngineConfig::default()
            },
            WETH,
        );
        (detector, cache)
    }

    fn publish(cache: &PairCache, venue: u16, x: Address, rx: u128, y: Address, ry: u128) {
        let key = PairKey::new(VenueId(venue), x, y);
        let (reserve0, reserve1) = if x <= y { (rx, ry) } else { (ry, rx) };
        cache.note_block(100);
        cache.publish(ReserveSnapshot {
            pair: key,
            address: Address::ZERO,
            reserve0: U256::from(reserve0),
            reserve1: U256::from(reserve1),
            block_number: 100,
            block_hash: B256::ZERO,
            observed_at: Utc::now(),
        });
    }

    const E18: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn mispriced_triangle_emits_candidate() {
        let (det, cache) = fixture();
        // WETH -> USDC on uniswap at $2000/WETH.
        publish(&cache, 0, WETH, 1_000 * E18, USDC, 2_000_000_000_000);
        // USDC -> USDT on uniswap near parity.
        publish(&cache, 0, USDC, 2_000_000_000_000, USDT, 2_000_000_000_000);
        // USDT -> WETH on sushiswap, WETH at a 2% discount: the edge.
        publish(&cache, 1, USDT, 1_960_000_000_000, WETH, 1_000 * E18);

        let head = BlockHead {
            number: 100,
            hash: B256::ZERO,
        };
        let mut out = ScanOutcome::default();
        scan_cycles(&det, head, 10_000_000_000, &mut out);

        assert!(!out.candidates.is_empty(), "2% edge must surface");
        let best = out
            .candidates
            .iter()
            .max_by_key(|o| o.net_profit_quote)
            .unwrap();
        assert_eq!(best.kind, OpportunityKind::Triangular);
        assert_eq!(best.legs.len(), 3);
        assert_eq!(best.legs[0].token_in, WETH);
        assert_eq!(best.legs[2].token_out, WETH);
        assert!(best.net_profit_quote > U256::ZERO);
        // Every pool that fed a candidate is marked impacted.
        assert!(!out.impacted.is_empty());
    }

    #[test]
    fn balanced_triangle_stays_quiet() {
        let (det, cache) = fixture();
        publish(&cache, 0, WETH, 1_000 * E18, USDC, 2_000_000_000_000);
        publish(&cache, 0, USDC, 2_000_000_000_000, USDT, 2_000_000_000_000);
        publish(&cache, 1, USDT, 2_000_000_000_000, WETH, 1_000 * E18);
        // Also give sushiswap the same WETH/USDC pool so more assignments
        // resolve, all of them flat.
        publish(&cache, 1, WETH, 1_000 * E18, USDC, 2_000_000_000_000);

        let head = BlockHead {
            number: 100,
            hash: B256::ZERO,
        };
        let mut out = ScanOutcome::default();
        scan_cycles(&det, head, 10_000_000_000, &mut out);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn single_venue_assignments_are_excluded() {
        let (det, cache) = fixture();
        // All three legs only exist on uniswap; every all-uniswap
        // assignment is skipped by the distinct-venue rule, so nothing can
        // be emitted even with a huge edge.
        publish(&cache, 0, WETH, 1_000 * E18, USDC, 2_000_000_000_000);
        publish(&cache, 0, USDC, 2_000_000_000_000, USDT, 2_000_000_000_000);
        publish(&cache, 0, USDT, 1_800_000_000_000, WETH, 1_000 * E18);

        let head = BlockHead {
            number: 100,
            hash: B256::ZERO,
        };
        let mut out = ScanOutcome::default();
        scan_cycles(&det, head, 10_000_000_000, &mut out);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn overlapping_winners_collapse_to_best() {
        let (det, cache) = fixture();
        // Legs on both venues with identical reserves: both directions and
        // several assignments hit the same pool sets.
        for v in [0u16, 1u16] {
            publish(&cache, v, WETH, 1_000 * E18, USDC, 2_000_000_000_000);
            publish(&cache, v, USDC, 2_000_000_000_000, USDT, 2_000_000_000_000);
            publish(&cache, v, USDT, 1_900_000_000_000, WETH, 1_000 * E18);
        }

        let head = BlockHead {
            number: 100,
            hash: B256::ZERO,
        };
        let mut out = ScanOutcome::default();
        scan_cycles(&det, head, 10_000_000_000, &mut out);

        // Each distinct pool set appears at most once, regardless of the
        // traversal direction that found it.
        let mut seen = Vec::new();
        for opp in &out.candidates {
            let mut set: Vec<(u16, Address, Address)> = opp
                .legs
                .iter()
                .map(|l| {
                    let (t0, t1) = if l.token_in <= l.token_out {
                        (l.token_in, l.token_out)
                    } else {
                        (l.token_out, l.token_in)
                    };
                    (l.venue.0, t0, t1)
                })
                .collect();
            set.sort();
            assert!(!seen.contains(&set), "duplicate pool set emitted");
            seen.push(set);
        }
    }
}
