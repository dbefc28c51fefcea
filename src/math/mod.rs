//! Exact constant-product AMM math.
//!
//! Everything here is pure integer arithmetic. Intermediates are widened to
//! 512 bits so `reserve * amount * fee` can never overflow, and divisions
//! floor exactly like the on-chain router math.

mod amm;
mod optimal;

pub use amm::{amounts_out, get_amount_in, get_amount_out, price_gap_exceeds, price_impact};
pub use optimal::{cycle_profit, optimal_cycle_size, optimal_two_leg_size, SizedTrade};
