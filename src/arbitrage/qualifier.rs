//! Candidate qualification: the ordered profit/fee/gas/liquidity filters.
//!
//! Checks run in a fixed order and the first failure decides the rejection
//! reason. All threshold math is integer (parts-per-million); USD thresholds
//! are converted into quote raw units before comparing.

use alloy::primitives::{Address, U256, U512};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::gas_cost_in_quote;
use crate::config::EngineConfig;
use crate::math;
use crate::types::{Opportunity, OpportunityStatus, Token};

/// Rejection reason codes, shared with the store and the read API.
pub mod reason {
    pub const UNKNOWN_QUOTE: &str = "unknown_quote";
    pub const MIN_PROFIT: &str = "min_profit";
    pub const MIN_MARGIN: &str = "min_margin";
    pub const MIN_LIQUIDITY: &str = "min_liquidity";
    pub const PRICE_IMPACT: &str = "price_impact";
    pub const GAS_PRICE: &str = "gas_price";
    pub const SAFETY_MARGIN: &str = "safety_margin";
    pub const STALE_DATA: &str = "stale_data";
    pub const EXPIRED: &str = "expired";
}

pub struct Qualifier {
    tokens: Arc<HashMap<Address, Token>>,
    engine: EngineConfig,
    native_token: Address,
}

impl Qualifier {
    pub fn new(
        tokens: Arc<HashMap<Address, Token>>,
        engine: EngineConfig,
        native_token: Address,
    ) -> Self {
        Self {
            tokens,
            engine,
            native_token,
        }
    }

    /// Apply the filter chain. Returns the record stamped either
    /// `Qualified` (with its expiry) or `Rejected` (with the first failing
    /// reason).
    pub fn qualify(&self, mut opp: Opportunity, gas_price_wei: u128) -> Opportunity {
        let Some(quote) = self.tokens.get(&opp.quote_token) else {
            return self.reject(opp, reason::UNKNOWN_QUOTE);
        };

        // Re-derive gas at the tick's gas price so the stored record and
        // the decision agree.
        let gas_quote = gas_cost_in_quote(
            &self.tokens,
            self.native_token,
            opp.quote_token,
            opp.kind,
            gas_price_wei,
            &self.engine,
        );
        opp.gas_cost_quote = gas_quote;
        opp.net_profit_quote = opp.gross_profit_quote.saturating_sub(gas_quote);

        let min_profit = quote.usd_to_raw(self.engine.min_profit_usd);

        // 1. Net profit floor.
        if opp.net_profit_quote < min_profit {
            return self.reject(opp, reason::MIN_PROFIT);
        }

        // 2. Margin floor: net / max(1, gas + fee) >= min_margin.
        let cost_base = (opp.gas_cost_quote + opp.fee_cost_quote).max(U256::from(1u8));
        let lhs = U512::from(opp.net_profit_quote) * U512::from(1_000_000u32);
        let rhs = U512::from(self.engine.min_margin_ppm()) * U512::from(cost_base);
        if lhs < rhs {
            return self.reject(opp, reason::MIN_MARGIN);
        }

        // 3. Liquidity floor on both terminal pools' quote reserves.
        let min_liquidity = quote.usd_to_raw(self.engine.min_liquidity_usd);
        let entry_quote_reserve = opp.leg_pools.first().map(|p| p.reserve_in);
        let exit_quote_reserve = opp.leg_pools.last().map(|p| p.reserve_out);
        match (entry_quote_reserve, exit_quote_reserve) {
            (Some(entry), Some(exit)) if entry >= min_liquidity && exit >= min_liquidity => {}
            _ => return self.reject(opp, reason::MIN_LIQUIDITY),
        }

        // 4. Per-leg price impact cap.
        let cap = Decimal::new(self.engine.max_price_impact_ppm() as i64, 6);
        let mut amount = opp.trade_amount_in;
        for pool in &opp.leg_pools {
            match math::price_impact(amount, pool.reserve_in, pool.reserve_out, pool.fee) {
                Ok(impact) if impact <= cap => {}
                _ => return self.reject(opp, reason::PRICE_IMPACT),
            }
            match math::get_amount_out(amount, pool.reserve_in, pool.reserve_out, pool.fee) {
                Ok(next) if !next.is_zero() => amount = next,
                _ => return self.reject(opp, reason::PRICE_IMPACT),
            }
        }

        // 5. Gas price ceiling; exactly at the cap passes.
        let max_gas_price_wei = self.engine.max_gas_price_gwei as u128 * 1_000_000_000;
        if gas_price_wei > max_gas_price_wei {
            return self.reject(opp, reason::GAS_PRICE);
        }

        // 6. Safety haircut, requalified against the profit floor.
        let after_safety = U512::from(opp.net_profit_quote)
            * U512::from(self.engine.safety_keep_ppm())
            / U512::from(1_000_000u32);
        if after_safety < U512::from(min_profit) {
            return self.reject(opp, reason::SAFETY_MARGIN);
        }

        // 7. Qualified; stamp the expiry clock.
        opp.status = OpportunityStatus::Qualified;
        opp.reason = None;
        opp.expires_at = opp.created_at
            + ChronoDuration::seconds(self.engine.opportunity_timeout_secs as i64);
        debug_assert!(opp.expires_at > opp.created_at);
        opp
    }

    fn reject(&self, mut opp: Opportunity, code: &str) -> Opportunity {
        debug!(id = %opp.id, reason = code, "candidate rejected");
        opp.status = OpportunityStatus::Rejected;
        opp.reason = Some(code.to_string());
        opp
    }
}

/// True when `opp` has outlived its expiry. Expired records are dropped
/// silently rather than logged as errors.
pub fn is_expired(opp: &Opportunity) -> bool {
    opp.is_expired(Utc::now())
}
