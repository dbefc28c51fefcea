//! Position sizing and the risk gate.
//!
//! `PortfolioState` is the process-wide simulated book: single writer
//! (the gate opens positions, the simulator closes them), immutable
//! snapshots for everyone else. The gate sizes a hypothetical position with
//! a fractional-Kelly heuristic and vetoes anything that would breach the
//! exposure, loss, concurrency or drawdown caps.

use alloy::primitives::{Address, I256, U256};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::arbitrage::qualifier::{is_expired, reason};
use crate::config::{EngineConfig, RiskConfig};
use crate::math;
use crate::types::{Opportunity, Token, VenueId};

/// Simulated portfolio book. All monetary fields are USD reference values;
/// sizing math on raw token amounts happens in the gate.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub exposure_per_venue_usd: HashMap<VenueId, f64>,
    pub total_exposure_usd: f64,
    pub daily_pnl_usd: f64,
    pub equity_usd: f64,
    pub peak_equity_usd: f64,
    pub active_positions: usize,
    last_reset_day: NaiveDate,
}

impl PortfolioState {
    pub fn new(starting_equity_usd: f64) -> Self {
        Self {
            exposure_per_venue_usd: HashMap::new(),
            total_exposure_usd: 0.0,
            daily_pnl_usd: 0.0,
            equity_usd: starting_equity_usd,
            peak_equity_usd: starting_equity_usd,
            active_positions: 0,
            last_reset_day: Utc::now().date_naive(),
        }
    }

    pub fn daily_loss_usd(&self) -> f64 {
        (-self.daily_pnl_usd).max(0.0)
    }

    pub fn drawdown(&self) -> f64 {
        if self.peak_equity_usd <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity_usd - self.equity_usd) / self.peak_equity_usd).max(0.0)
    }
}

/// Shared handle: writers go through the mutating methods, readers take
/// cloned snapshots.
#[derive(Clone)]
pub struct Portfolio {
    inner: Arc<RwLock<PortfolioState>>,
    reset_hour_utc: u32,
}

impl Portfolio {
    pub fn new(starting_equity_usd: f64, reset_hour_utc: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PortfolioState::new(starting_equity_usd))),
            reset_hour_utc,
        }
    }

    pub async fn snapshot(&self) -> PortfolioState {
        self.inner.read().await.clone()
    }

    /// Roll the daily P&L at the configured wall-clock boundary.
    pub async fn maybe_reset_daily(&self) {
        let boundary_day =
            (Utc::now() - ChronoDuration::hours(self.reset_hour_utc as i64)).date_naive();
        let mut state = self.inner.write().await;
        if boundary_day > state.last_reset_day {
            debug!(day = %boundary_day, "daily P&L reset");
            state.daily_pnl_usd = 0.0;
            state.last_reset_day = boundary_day;
        }
    }

    pub async fn open_position(&self, venue: VenueId, notional_usd: f64) {
        let mut state = self.inner.write().await;
        *state.exposure_per_venue_usd.entry(venue).or_insert(0.0) += notional_usd;
        state.total_exposure_usd += notional_usd;
        state.active_positions += 1;
    }

    pub async fn close_position(&self, venue: VenueId, notional_usd: f64, pnl_usd: f64) {
        let mut state = self.inner.write().await;
        if let Some(exposure) = state.exposure_per_venue_usd.get_mut(&venue) {
            *exposure = (*exposure - notional_usd).max(0.0);
        }
        state.total_exposure_usd = (state.total_exposure_usd - notional_usd).max(0.0);
        state.active_positions = state.active_positions.saturating_sub(1);
        state.daily_pnl_usd += pnl_usd;
        state.equity_usd += pnl_usd;
        state.peak_equity_usd = state.peak_equity_usd.max(state.equity_usd);
    }
}

/// Gate decision for one qualified opportunity.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub approved: bool,
    pub sized_amount: U256,
    /// Observability score in [0, 1]; higher is riskier. Never a gate.
    pub score: f64,
    pub reasons: Vec<String>,
}

pub struct RiskGate {
    tokens: Arc<HashMap<Address, Token>>,
    risk: RiskConfig,
    engine: EngineConfig,
    portfolio: Portfolio,
}

impl RiskGate {
    pub fn new(
        tokens: Arc<HashMap<Address, Token>>,
        risk: RiskConfig,
        engine: EngineConfig,
        portfolio: Portfolio,
    ) -> Self {
        Self {
            tokens,
            risk,
            engine,
            portfolio,
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub async fn assess(&self, opp: &Opportunity) -> Assessment {
        // Expired records drop silently: not approved, no error noise.
        if is_expired(opp) {
            return Assessment {
                approved: false,
                sized_amount: U256::ZERO,
                score: 1.0,
                reasons: vec![reason::EXPIRED.to_string()],
            };
        }

        let Some(quote) = self.tokens.get(&opp.quote_token) else {
            return Assessment {
                approved: false,
                sized_amount: U256::ZERO,
                score: 1.0,
                reasons: vec![reason::UNKNOWN_QUOTE.to_string()],
            };
        };

        let state = self.portfolio.snapshot().await;
        let mut reasons = Vec::new();

        let (sized_amount, net_at_sized) = self.size_position(opp, quote, &mut reasons);
        let sized_usd = quote.raw_to_usd(sized_amount);

        // Exposure cap against total portfolio value.
        let exposure_cap = self.risk.max_portfolio_exposure * state.equity_usd;
        if state.total_exposure_usd + sized_usd > exposure_cap {
            reasons.push("max_exposure".to_string());
        }

        // Daily loss already breached.
        if state.daily_loss_usd() >= self.risk.max_daily_loss_usd {
            reasons.push("max_daily_loss".to_string());
        }

        // Worst-case loss of this position must fit the remaining budget.
        let potential_loss = sized_usd * self.risk.assumed_loss_fraction;
        if potential_loss > self.risk.max_daily_loss_usd - state.daily_loss_usd() {
            reasons.push("potential_loss".to_string());
        }

        if state.active_positions >= self.risk.max_concurrent_positions {
            reasons.push("max_positions".to_string());
        }

        if state.drawdown() > self.risk.max_drawdown {
            reasons.push("max_drawdown".to_string());
        }

        // Per-leg price impact re-checked at the sized amount.
        let cap = Decimal::new(self.engine.max_price_impact_ppm() as i64, 6);
        let mut amount = sized_amount;
        for pool in &opp.leg_pools {
            let within = math::price_impact(amount, pool.reserve_in, pool.reserve_out, pool.fee)
                .map(|impact| impact <= cap)
                .unwrap_or(false);
            if !within {
                reasons.push("price_impact".to_string());
                break;
            }
            match math::get_amount_out(amount, pool.reserve_in, pool.reserve_out, pool.fee) {
                Ok(next) if !next.is_zero() => amount = next,
                _ => {
                    reasons.push("price_impact".to_string());
                    break;
                }
            }
        }

        let score = self.score(opp, &state, sized_usd, net_at_sized, quote);
        let approved = reasons.is_empty() && !sized_amount.is_zero();

        Assessment {
            approved,
            sized_amount,
            score,
            reasons,
        }
    }

    /// Fractional-Kelly sizing clamped to the position limits and to the
    /// detector's optimum, re-priced through the AMM math when the size
    /// moved off the optimum.
    fn size_position(
        &self,
        opp: &Opportunity,
        quote: &Token,
        reasons: &mut Vec<String>,
    ) -> (U256, U256) {
        let margin = opp.margin();
        let f_star = if margin > 1.0 { (margin - 1.0) / margin } else { 0.0 };
        let fraction = self.risk.kelly_fraction * f_star;

        let sized_usd = (fraction * self.risk.available_capital_usd)
            .clamp(self.risk.min_position_usd, self.risk.max_position_usd);
        let mut sized = quote.usd_to_raw(sized_usd);
        // Never above the detector's optimum.
        sized = sized.min(opp.trade_amount_in);

        if sized == opp.trade_amount_in {
            return (sized, opp.net_profit_quote);
        }

        let min_profit = quote.usd_to_raw(self.engine.min_profit_usd);
        let net = math::cycle_profit(sized, &opp.leg_pools, opp.gas_cost_quote)
            .filter(|p| *p > I256::ZERO)
            .and_then(|p| U256::try_from(p).ok())
            .unwrap_or(U256::ZERO);

        if net >= min_profit {
            return (sized, net);
        }

        // The shrunk size no longer clears the profit floor; fall back to
        // the detector's optimum if the limits allow it.
        let optimum_usd = quote.raw_to_usd(opp.trade_amount_in);
        if optimum_usd <= self.risk.max_position_usd {
            (opp.trade_amount_in, opp.net_profit_quote)
        } else {
            reasons.push("unsizeable".to_string());
            (U256::ZERO, U256::ZERO)
        }
    }

    /// Weighted observability score: margin deficit, liquidity usage,
    /// exposure fraction, gas share, plus a constant volatility term.
    fn score(
        &self,
        opp: &Opportunity,
        state: &PortfolioState,
        sized_usd: f64,
        net_at_sized: U256,
        quote: &Token,
    ) -> f64 {
        let margin = opp.margin();
        let margin_deficit = if margin <= 1.0 {
            1.0
        } else {
            (2.0 / margin).min(1.0)
        };

        let entry_reserve_usd = opp
            .leg_pools
            .first()
            .map(|p| quote.raw_to_usd(p.reserve_in))
            .unwrap_or(0.0);
        let liquidity_ratio = if entry_reserve_usd > 0.0 {
            (sized_usd / entry_reserve_usd).min(1.0)
        } else {
            1.0
        };

        let exposure_fraction = if state.equity_usd > 0.0 {
            ((state.total_exposure_usd + sized_usd) / state.equity_usd).min(1.0)
        } else {
            1.0
        };

        let net_usd = quote.raw_to_usd(net_at_sized);
        let gas_usd = quote.raw_to_usd(opp.gas_cost_quote);
        let gas_fraction = if net_usd + gas_usd > 0.0 {
            gas_usd / (net_usd + gas_usd)
        } else {
            1.0
        };

        let score = 0.3 * margin_deficit
            + 0.25 * liquidity_ratio
            + 0.2 * exposure_fraction
            + 0.15 * gas_fraction
            + 0.1; // volatility constant
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeeRate, Leg, LegPool, OpportunityKind, OpportunityStatus};
    use alloy::primitives::{address, B256};

    const WETH: Address = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
    const USDC: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

    fn tokens() -> Arc<HashMap<Address, Token>> {
        let mut map = HashMap::new();
        map.insert(
            WETH,
            Token {
                address: WETH,
                symbol: "WETH".into(),
                decimals: 18,
                usd_price: 2000.0,
            },
        );
        map.insert(
            USDC,
            Token {
                address: USDC,
                symbol: "USDC".into(),
                decimals: 6,
                usd_price: 1.0,
            },
        );
        Arc::new(map)
    }

    fn qualified() -> Opportunity {
        let deep = 2_000_000_000_000u128;
        let created_at = Utc::now();
        Opportunity {
            id: "test:0".into(),
            kind: OpportunityKind::TwoLeg,
            legs: vec![
                Leg {
                    venue: VenueId(0),
                    token_in: USDC,
                    token_out: WETH,
                },
                Leg {
                    venue: VenueId(1),
                    token_in: WETH,
                    token_out: USDC,
                },
            ],
            leg_pools: vec![
                LegPool {
                    reserve_in: U256::from(deep),
                    reserve_out: U256::from(1_000_000_000_000_000_000_000u128),
                    fee: FeeRate::V2_DEFAULT,
                },
                LegPool {
                    // Sell pool priced 5% rich so re-pricing at smaller
                    // sizes still nets a profit.
                    reserve_in: U256::from(1_000_000_000_000_000_000_000u128),
                    reserve_out: U256::from(2_100_000_000_000u128),
                    fee: FeeRate::V2_DEFAULT,
                },
            ],
            trade_amount_in: U256::from(2_000_000_000u64), // 2000 USDC optimum
            quote_token: USDC,
            gross_profit_quote: U256::from(150_000_000u64),
            net_profit_quote: U256::from(145_000_000u64),
            gas_cost_quote: U256::from(5_000_000u64),
            fee_cost_quote: U256::from(30_000_000u64),
            block_number: 100,
            block_hash: B256::ZERO,
            created_at,
            expires_at: created_at + ChronoDuration::seconds(30),
            status: OpportunityStatus::Qualified,
            reason: None,
        }
    }

    fn gate(risk: RiskConfig) -> RiskGate {
        RiskGate::new(
            tokens(),
            risk,
            EngineConfig::default(),
            Portfolio::new(100_000.0, 0),
        )
    }

    #[tokio::test]
    async fn healthy_opportunity_is_approved_and_sized() {
        let gate = gate(RiskConfig::default());
        let assessment = gate.assess(&qualified()).await;
        assert!(assessment.approved, "reasons: {:?}", assessment.reasons);
        assert!(assessment.sized_amount > U256::ZERO);
        assert!(assessment.sized_amount <= qualified().trade_amount_in);
        assert!((0.0..=1.0).contains(&assessment.score));
    }

    #[tokio::test]
    async fn expired_opportunity_drops_silently() {
        let gate = gate(RiskConfig::default());
        let mut opp = qualified();
        opp.expires_at = opp.created_at - ChronoDuration::seconds(1);
        let assessment = gate.assess(&opp).await;
        assert!(!assessment.approved);
        assert_eq!(assessment.reasons, vec![reason::EXPIRED.to_string()]);
    }

    #[tokio::test]
    async fn concurrency_cap_vetoes() {
        let gate = gate(RiskConfig {
            max_concurrent_positions: 1,
            ..RiskConfig::default()
        });
        gate.portfolio().open_position(VenueId(0), 100.0).await;
        let assessment = gate.assess(&qualified()).await;
        assert!(!assessment.approved);
        assert!(assessment.reasons.contains(&"max_positions".to_string()));
    }

    #[tokio::test]
    async fn daily_loss_budget_vetoes() {
        let gate = gate(RiskConfig {
            max_daily_loss_usd: 100.0,
            ..RiskConfig::default()
        });
        // Burn the budget: open and close a losing position.
        gate.portfolio().open_position(VenueId(0), 1_000.0).await;
        gate.portfolio()
            .close_position(VenueId(0), 1_000.0, -150.0)
            .await;
        let assessment = gate.assess(&qualified()).await;
        assert!(!assessment.approved);
        assert!(assessment.reasons.contains(&"max_daily_loss".to_string()));
    }

    #[tokio::test]
    async fn drawdown_cap_vetoes() {
        let gate = gate(RiskConfig {
            max_drawdown: 0.1,
            max_daily_loss_usd: 1_000_000.0,
            ..RiskConfig::default()
        });
        // Lose 20% of equity: drawdown 0.2 > cap 0.1.
        gate.portfolio().open_position(VenueId(0), 0.0).await;
        gate.portfolio()
            .close_position(VenueId(0), 0.0, -20_000.0)
            .await;
        let assessment = gate.assess(&qualified()).await;
        assert!(!assessment.approved);
        assert!(assessment.reasons.contains(&"max_drawdown".to_string()));
    }

    #[tokio::test]
    async fn sizing_never_exceeds_detector_optimum() {
        let gate = gate(RiskConfig {
            available_capital_usd: 100_000_000.0,
            max_position_usd: 50_000_000.0,
            ..RiskConfig::default()
        });
        let opp = qualified();
        let assessment = gate.assess(&opp).await;
        assert!(assessment.sized_amount <= opp.trade_amount_in);
    }

    #[tokio::test]
    async fn portfolio_daily_reset_rolls_pnl() {
        let portfolio = Portfolio::new(1_000.0, 0);
        portfolio.open_position(VenueId(0), 10.0).await;
        portfolio.close_position(VenueId(0), 10.0, -50.0).await;
        assert!((portfolio.snapshot().await.daily_loss_usd() - 50.0).abs() < 1e-9);

        // Force yesterday as the last reset day, then roll.
        {
            let mut state = portfolio.inner.write().await;
            state.last_reset_day = state.last_reset_day - ChronoDuration::days(1);
        }
        portfolio.maybe_reset_daily().await;
        let state = portfolio.snapshot().await;
        assert_eq!(state.daily_pnl_usd, 0.0);
        // Equity keeps the realized loss; only the daily counter rolls.
        assert!((state.equity_usd - 950.0).abs() < 1e-9);
    }
}
