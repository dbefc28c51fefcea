//! Opportunity detection and qualification.

pub mod detector;
pub mod qualifier;
mod triangular;

pub use detector::{Detector, ScanOutcome};
pub use qualifier::Qualifier;

use alloy::primitives::{Address, U256, U512};
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::types::{FeeRate, OpportunityKind, Token};

/// Gas cost of executing `kind`, converted to raw units of `quote`.
///
/// `gas_estimate(kind) * gas_buffer * gas_price * usd(native) / usd(quote)`.
/// The estimate is a table lookup; the USD hop uses the configured reference
/// prices, which is the only place detection leaves integer space.
pub fn gas_cost_in_quote(
    tokens: &HashMap<Address, Token>,
    native: Address,
    quote: Address,
    kind: OpportunityKind,
    gas_price_wei: u128,
    engine: &EngineConfig,
) -> U256 {
    let (Some(native_token), Some(quote_token)) = (tokens.get(&native), tokens.get(&quote)) else {
        return U256::ZERO;
    };

    let gas_units = match kind {
        OpportunityKind::TwoLeg => engine.gas_estimate_two_leg,
        OpportunityKind::Triangular => engine.gas_estimate_triangular,
    };

    let buffered = gas_units as f64 * engine.gas_buffer;
    let native_amount = buffered * gas_price_wei as f64 / 10f64.powi(native_token.decimals as i32);
    let usd = native_amount * native_token.usd_price;
    quote_token.usd_to_raw(usd)
}

/// Cumulative swap fees of a cycle, in quote raw units.
///
/// Each leg's notional equals the entry amount valued at the implied
/// traversal price, so the per-leg fee collapses to
/// `amount_in * (den - num) / den` in the quote token.
pub fn fee_cost_in_quote(amount_in: U256, fees: &[FeeRate]) -> U256 {
    let mut total = U512::ZERO;
    for fee in fees {
        total += U512::from(amount_in) * U512::from(fee.den - fee.num) / U512::from(fee.den);
    }
    total.min(U512::from(U256::MAX)).to::<U256>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn fee_cost_sums_per_leg() {
        let fees = [FeeRate::V2_DEFAULT, FeeRate::V2_DEFAULT];
        // 0.3% of 1_000_000 twice.
        assert_eq!(
            fee_cost_in_quote(U256::from(1_000_000u64), &fees),
            U256::from(6_000u64)
        );
    }

    #[test]
    fn gas_cost_conversion() {
        let weth = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
        let usdc = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");
        let mut tokens = HashMap::new();
        tokens.insert(
            weth,
            Token {
                address: weth,
                symbol: "WETH".into(),
                decimals: 18,
                usd_price: 2000.0,
            },
        );
        tokens.insert(
            usdc,
            Token {
                address: usdc,
                symbol: "USDC".into(),
                decimals: 6,
                usd_price: 1.0,
            },
        );
        let engine = EngineConfig {
            gas_estimate_two_leg: 200_000,
            gas_buffer: 1.2,
            ..EngineConfig::default()
        };

        // 200k gas * 1.2 buffer at 50 gwei = 0.012 ETH = $24 = 24e6 raw USDC.
        let cost = gas_cost_in_quote(
            &tokens,
            weth,
            usdc,
            OpportunityKind::TwoLeg,
            50_000_000_000,
            &engine,
        );
        assert_eq!(cost, U256::from(24_000_000u64));
    }
}
