//! Optimal trade sizing.
//!
//! Net profit of a constant-product cycle is unimodal in the input amount:
//! marginal output strictly decreases on every hop, so profit is a concave
//! output curve minus a linear spend. That licenses integer ternary search,
//! shrunk to a window of at most two and finished with a linear sweep.

use alloy::primitives::{I256, U256};

use super::amm::get_amount_out;
use crate::types::LegPool;

/// Result of a sizing search: the input that maximizes net profit, and that
/// profit. `net_profit` is strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedTrade {
    pub amount_in: U256,
    pub net_profit: U256,
}

/// Signed net profit of pushing `amount_in` through `legs`, minus
/// `gas_quote`. Returns `None` when any hop fails or rounds to zero, which
/// sizing treats as negative infinity for that probe only.
pub fn cycle_profit(amount_in: U256, legs: &[LegPool], gas_quote: U256) -> Option<I256> {
    if amount_in.is_zero() || legs.is_empty() {
        return None;
    }
    let mut current = amount_in;
    for leg in legs {
        current = get_amount_out(current, leg.reserve_in, leg.reserve_out, leg.fee).ok()?;
        if current.is_zero() {
            return None;
        }
    }
    let out = I256::try_from(current).ok()?;
    let spend = I256::try_from(amount_in)
        .ok()?
        .checked_add(I256::try_from(gas_quote).ok()?)?;
    out.checked_sub(spend)
}

/// Ternary search for the profit maximum of `legs` over `[low, high]`.
/// `Option<I256>` orders `None` below every `Some`, which is exactly the
/// negative-infinity treatment failing probes need.
fn ternary_max(
    legs: &[LegPool],
    gas_quote: U256,
    mut low: U256,
    mut high: U256,
) -> (U256, Option<I256>) {
    let three = U256::from(3u8);

    while high - low > U256::from(2u8) {
        let third = (high - low) / three;
        let m1 = low + third;
        let m2 = high - third;
        if cycle_profit(m1, legs, gas_quote) < cycle_profit(m2, legs, gas_quote) {
            low = m1;
        } else {
            high = m2;
        }
    }

    // Linear sweep of the residual window. Strict comparison keeps the
    // smallest amount on profit ties.
    let mut best_amount = low;
    let mut best_profit = cycle_profit(low, legs, gas_quote);
    let mut amount = low + U256::from(1u8);
    while amount <= high {
        let profit = cycle_profit(amount, legs, gas_quote);
        if profit > best_profit {
            best_profit = profit;
            best_amount = amount;
        }
        amount += U256::from(1u8);
    }

    (best_amount, best_profit)
}

fn positive_trade(amount: U256, profit: Option<I256>) -> Option<SizedTrade> {
    match profit {
        Some(p) if p > I256::ZERO => Some(SizedTrade {
            amount_in: amount,
            net_profit: U256::try_from(p).ok()?,
        }),
        _ => None,
    }
}

/// Optimal size for a two-leg round trip: buy `buy`, sell `sell`. Searches
/// `[1, max_in]` in `O(log max_in)` big-integer probes. Returns `None` when
/// no size clears `gas_quote`.
pub fn optimal_two_leg_size(
    buy: LegPool,
    sell: LegPool,
    max_in: U256,
    gas_quote: U256,
) -> Option<SizedTrade> {
    if max_in.is_zero() {
        return None;
    }
    let legs = [buy, sell];
    let (amount, profit) = ternary_max(&legs, gas_quote, U256::from(1u8), max_in);
    positive_trade(amount, profit)
}

/// Optimal size for an arbitrary cycle (triangular in practice). A coarse
/// geometric probe over `reserve/k, k = 1024..1` brackets the profitable
/// region first; ternary search then refines inside the bracket.
pub fn optimal_cycle_size(
    legs: &[LegPool],
    max_in: U256,
    gas_quote: U256,
) -> Option<SizedTrade> {
    if max_in.is_zero() || legs.is_empty() {
        return None;
    }

    let reserve = legs[0].reserve_in;
    let mut best_probe: Option<(U256, Option<I256>)> = None;

    let mut k = 1024u32;
    while k >= 1 {
        let probe = (reserve / U256::from(k)).clamp(U256::from(1u8), max_in);
        let profit = cycle_profit(probe, legs, gas_quote);
        match &best_probe {
            Some((_, best)) if &profit <= best => {}
            _ => best_probe = Some((probe, profit)),
        }
        if k == 1 {
            break;
        }
        k /= 2;
    }

    let (anchor, _) = best_probe?;
    let low = (anchor / U256::from(2u8)).max(U256::from(1u8));
    let high = anchor.saturating_mul(U256::from(2u8)).min(max_in);

    let (amount, profit) = ternary_max(legs, gas_quote, low, high.max(low));
    positive_trade(amount, profit)
}
