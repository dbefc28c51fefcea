//! Single-hop swap math for constant-product pools.

use alloy::primitives::{U256, U512};
use rust_decimal::Decimal;

use crate::error::MathError;
use crate::types::{FeeRate, LegPool};

/// Output amount for a swap of `amount_in` against `(reserve_in, reserve_out)`.
///
/// `amount_out = floor(amount_in * fee_num * reserve_out
///                     / (reserve_in * fee_den + amount_in * fee_num))`
///
/// Always strictly less than `reserve_out`.
pub fn get_amount_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee: FeeRate,
) -> Result<U256, MathError> {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(MathError::InvalidInput);
    }

    let amount_in_with_fee = U512::from(amount_in) * U512::from(fee.num);
    let numerator = amount_in_with_fee * U512::from(reserve_out);
    let denominator = U512::from(reserve_in) * U512::from(fee.den) + amount_in_with_fee;

    // denominator > numerator / reserve_out, so the quotient fits in U256.
    Ok((numerator / denominator).to::<U256>())
}

/// Input amount required to obtain exactly `amount_out`.
///
/// `amount_in = floor(reserve_in * amount_out * fee_den
///                    / ((reserve_out - amount_out) * fee_num)) + 1`
///
/// Guarantees `get_amount_out(get_amount_in(x)) >= x`.
pub fn get_amount_in(
    amount_out: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee: FeeRate,
) -> Result<U256, MathError> {
    if amount_out.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(MathError::InvalidInput);
    }
    if amount_out >= reserve_out {
        return Err(MathError::InsufficientLiquidity);
    }

    let numerator = U512::from(reserve_in) * U512::from(amount_out) * U512::from(fee.den);
    let denominator = U512::from(reserve_out - amount_out) * U512::from(fee.num);

    let amount_in = numerator / denominator + U512::from(1u8);
    if amount_in > U512::from(U256::MAX) {
        return Err(MathError::InsufficientLiquidity);
    }
    Ok(amount_in.to::<U256>())
}

/// Apply `get_amount_out` hop by hop along `hops`, failing fast with
/// `InsufficientLiquidity` on the first hop that produces zero output.
/// Returns the output of every hop in order.
pub fn amounts_out(amount_in: U256, hops: &[LegPool]) -> Result<Vec<U256>, MathError> {
    let mut outs = Vec::with_capacity(hops.len());
    let mut current = amount_in;
    for hop in hops {
        let out = get_amount_out(current, hop.reserve_in, hop.reserve_out, hop.fee)?;
        if out.is_zero() {
            return Err(MathError::InsufficientLiquidity);
        }
        outs.push(out);
        current = out;
    }
    Ok(outs)
}

/// Price impact of a swap, in `[0, 1)`:
/// `1 - (amount_out / amount_in) / (reserve_out / reserve_in)`,
/// computed in exact rationals and truncated to six decimal places.
pub fn price_impact(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee: FeeRate,
) -> Result<Decimal, MathError> {
    let amount_out = get_amount_out(amount_in, reserve_in, reserve_out, fee)?;

    // impact = (a_in * r_out - a_out * r_in) / (a_in * r_out)
    let spot = U512::from(amount_in) * U512::from(reserve_out);
    let exec = U512::from(amount_out) * U512::from(reserve_in);
    let deficit = spot.saturating_sub(exec);

    let ppm = (deficit * U512::from(1_000_000u32)) / spot;
    // deficit < spot, so ppm < 1_000_000 and the narrowing is safe.
    Ok(Decimal::new(ppm.to::<u64>() as i64, 6))
}

/// True when the relative spot-price gap between two pools of the same pair
/// exceeds `threshold_ppm`, decided by cross-multiplication so no rational is
/// ever materialized:
///
/// `|p_a - p_b| / min(p_a, p_b) > threshold`
/// `<=> |r1_a*r0_b - r1_b*r0_a| * 1e6 > threshold_ppm * min(r1_a*r0_b, r1_b*r0_a)`
pub fn price_gap_exceeds(
    (r0_a, r1_a): (U256, U256),
    (r0_b, r1_b): (U256, U256),
    threshold_ppm: u64,
) -> bool {
    if r0_a.is_zero() || r1_a.is_zero() || r0_b.is_zero() || r1_b.is_zero() {
        return false;
    }

    let p_a = U512::from(r1_a) * U512::from(r0_b);
    let p_b = U512::from(r1_b) * U512::from(r0_a);
    let min_price = p_a.min(p_b);
    let gap = if p_a >= p_b { p_a - p_b } else { p_b - p_a };

    gap * U512::from(1_000_000u32) > U512::from(threshold_ppm) * min_price
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    const FEE: FeeRate = FeeRate::V2_DEFAULT;

    fn u(v: u128) -> U256 {
        U256::from(v)
    }

    #[test]
    fn amount_out_matches_v2_router_semantics() {
        // (1000 * 997 * 10_000) / (10_000 * 1000 + 1000 * 997) = 906 (floor)
        let out = get_amount_out(u(1000), u(10_000), u(10_000), FEE).unwrap();
        assert_eq!(out, u(906));
    }

    #[test]
    fn amount_out_rejects_zero_inputs() {
        assert_eq!(
            get_amount_out(U256::ZERO, u(100), u(100), FEE),
            Err(MathError::InvalidInput)
        );
        assert_eq!(
            get_amount_out(u(100), U256::ZERO, u(100), FEE),
            Err(MathError::InvalidInput)
        );
        assert_eq!(
            get_amount_out(u(100), u(100), U256::ZERO, FEE),
            Err(MathError::InvalidInput)
        );
    }

    #[test]
    fn amount_in_near_full_reserve_is_finite() {
        // amount_out = reserve_out - 1 demands a huge but finite input.
        let r_in = u(1_000_000_000_000_000_000);
        let r_out = u(2_000_000_000);
        let a_in = get_amount_in(r_out - u(1), r_in, r_out, FEE).unwrap();
        assert!(a_in > r_in);
        let verified = get_amount_out(a_in, r_in, r_out, FEE).unwrap();
        assert!(verified >= r_out - u(1));
    }

    #[test]
    fn amount_in_rejects_output_at_or_above_reserve() {
        assert_eq!(
            get_amount_in(u(100), u(1000), u(100), FEE),
            Err(MathError::InsufficientLiquidity)
        );
        assert_eq!(
            get_amount_in(u(101), u(1000), u(100), FEE),
            Err(MathError::InsufficientLiquidity)
        );
    }

    #[test]
    fn amounts_out_fails_fast_on_dusty_hop() {
        let hops = [
            LegPool {
                reserve_in: u(1_000_000),
                reserve_out: u(2),
                fee: FEE,
            },
            LegPool {
                reserve_in: u(1_000_000),
                reserve_out: u(1_000_000),
                fee: FEE,
            },
        ];
        // First hop rounds to zero output.
        assert_eq!(
            amounts_out(u(10), &hops),
            Err(MathError::InsufficientLiquidity)
        );
    }

    #[test]
    fn price_impact_small_trade_is_near_fee() {
        // A tiny trade against a deep pool: impact ~ the 0.30% fee.
        let impact = price_impact(u(1_000_000), u(1_000_000_000_000), u(1_000_000_000_000), FEE)
            .unwrap();
        assert!(impact >= dec!(0.003));
        assert!(impact < dec!(0.0031));
    }

    #[test]
    fn price_impact_large_trade_dominates_fee() {
        // 10% of the pool moves the price well past the fee.
        let impact =
            price_impact(u(100_000_000), u(1_000_000_000), u(1_000_000_000), FEE).unwrap();
        assert!(impact > dec!(0.09));
        assert!(impact < dec!(1));
    }

    #[test]
    fn price_gap_cross_multiplication() {
        // 2000 vs 2020 per unit: 1% gap.
        let a = (u(1_000_000), u(2_000_000_000));
        let b = (u(1_000_000), u(2_020_000_000));
        assert!(price_gap_exceeds(a, b, 5_000)); // > 0.5%
        assert!(!price_gap_exceeds(a, b, 20_000)); // not > 2%
        assert!(!price_gap_exceeds(a, a, 1)); // identical pools
    }

    proptest! {
        #[test]
        fn output_always_below_reserve_out(
            a_in in 1u128..=u128::MAX >> 16,
            r_in in 1u128..(1u128 << 112),
            r_out in 1u128..(1u128 << 112),
        ) {
            let out = get_amount_out(u(a_in), u(r_in), u(r_out), FEE).unwrap();
            prop_assert!(out < u(r_out));
        }

        #[test]
        fn amount_in_round_trip_covers_request(
            a_out in 1u128..1_000_000_000_000u128,
            r_in in 1u128..(1u128 << 100),
            r_out in 1u128..(1u128 << 100),
        ) {
            prop_assume!(a_out < r_out);
            let a_in = get_amount_in(u(a_out), u(r_in), u(r_out), FEE).unwrap();
            let got = get_amount_out(a_in, u(r_in), u(r_out), FEE).unwrap();
            prop_assert!(got >= u(a_out));
        }

        #[test]
        fn identical_pools_never_profit(
            a_in in 1u128..(1u128 << 80),
            r0 in 1u128..(1u128 << 112),
            r1 in 1u128..(1u128 << 112),
        ) {
            // Round trip across two identical pools, even with fee_num == fee_den,
            // can only lose to flooring.
            let no_fee = FeeRate::new(1000, 1000);
            let mid = get_amount_out(u(a_in), u(r0), u(r1), no_fee).unwrap();
            if !mid.is_zero() {
                let back = get_amount_out(mid, u(r1), u(r0), no_fee).unwrap();
                prop_assert!(back <= u(a_in));
            }
        }
    }
}
