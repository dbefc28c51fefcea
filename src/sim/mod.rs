//! Simulated execution.
//!
//! No transaction ever leaves the process: the simulator's only job is to
//! produce realistic post-trade telemetry. It models slippage, gas variance
//! and execution latency with timestamp-seeded pseudo-randomness, closes
//! the hypothetical position on the portfolio book, and flips the stored
//! record to `SimulatedExecuted`. Runs as an independent task; it never
//! interleaves with detection.

use alloy::primitives::{Address, I256, U256};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::math;
use crate::risk::Portfolio;
use crate::stats::Stats;
use crate::store::{BufferedStore, SqliteStore};
use crate::types::{Opportunity, OpportunityStatus, Token};

/// An approved opportunity handed over for simulated execution.
#[derive(Debug, Clone)]
pub struct SimulatedTrade {
    pub opportunity: Opportunity,
    pub sized_amount: U256,
}

pub struct ExecutionSimulator {
    portfolio: Portfolio,
    store: Arc<BufferedStore<SqliteStore>>,
    tokens: Arc<HashMap<Address, Token>>,
    stats: Arc<Stats>,
}

impl ExecutionSimulator {
    pub fn new(
        portfolio: Portfolio,
        store: Arc<BufferedStore<SqliteStore>>,
        tokens: Arc<HashMap<Address, Token>>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            portfolio,
            store,
            tokens,
            stats,
        }
    }

    /// Consume approved trades until the channel closes or shutdown flips.
    pub async fn run(
        self,
        mut trades: mpsc::Receiver<SimulatedTrade>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                trade = trades.recv() => match trade {
                    Some(trade) => self.execute(trade).await,
                    None => break,
                },
            }
        }
        info!("execution simulator stopped");
    }

    async fn execute(&self, trade: SimulatedTrade) {
        let opp = &trade.opportunity;
        let Some(quote) = self.tokens.get(&opp.quote_token) else {
            return;
        };

        // Expected outcome at the sized amount, straight from the AMM math.
        let expected_net = math::cycle_profit(
            trade.sized_amount,
            &opp.leg_pools,
            opp.gas_cost_quote,
        )
        .filter(|p| *p > I256::ZERO)
        .and_then(|p| U256::try_from(p).ok())
        .unwrap_or(U256::ZERO);
        let expected_net_usd = quote.raw_to_usd(expected_net);

        self.simulate_latency().await;

        // Slippage eats 5-40% of the expected profit; gas drifts around the
        // estimate. Timestamp-seeded so reruns are reproducible enough.
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
        let slippage_fraction = 0.05 + (seed % 1000) as f64 / 1000.0 * 0.35;
        let gas_drift = 0.9 + ((seed >> 10) % 200) as f64 / 1000.0;

        let gas_usd = quote.raw_to_usd(opp.gas_cost_quote) * gas_drift;
        let realized_usd = expected_net_usd * (1.0 - slippage_fraction)
            + quote.raw_to_usd(opp.gas_cost_quote)
            - gas_usd;

        let notional_usd = quote.raw_to_usd(trade.sized_amount);
        let venue = opp.legs.first().map(|l| l.venue);
        if let Some(venue) = venue {
            self.portfolio
                .close_position(venue, notional_usd, realized_usd)
                .await;
        }

        self.store
            .update_status(&opp.id, OpportunityStatus::SimulatedExecuted, None);
        self.stats
            .simulated_executed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        debug!(
            id = %opp.id,
            expected_usd = expected_net_usd,
            realized_usd,
            slippage = slippage_fraction,
            "simulated execution complete"
        );
    }

    /// 10-50ms of pretend network latency.
    async fn simulate_latency(&self) {
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
        let delay_ms = 10 + seed % 40;
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }
}
