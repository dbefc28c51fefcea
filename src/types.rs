//! Core data structures shared across the scanner pipeline.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Swap fee expressed as a numerator/denominator pair.
/// The V2 standard is 997/1000 (0.30%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub num: u32,
    pub den: u32,
}

impl FeeRate {
    pub const V2_DEFAULT: FeeRate = FeeRate { num: 997, den: 1000 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Fee taken from the input amount, as a fraction (e.g. 0.003).
    pub fn fee_fraction(&self) -> f64 {
        1.0 - self.num as f64 / self.den as f64
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self::V2_DEFAULT
    }
}

/// A token with its out-of-band metadata. Decimals are mandatory; tokens
/// with unknown decimals are rejected at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// Reference USD price used for risk accounting and display only.
    /// All profit math stays in raw quote-token units.
    pub usd_price: f64,
}

impl Token {
    /// Convert a raw amount of this token to a USD figure for reporting.
    pub fn raw_to_usd(&self, amount: U256) -> f64 {
        let raw = amount.to_string().parse::<f64>().unwrap_or(f64::MAX);
        raw / 10f64.powi(self.decimals as i32) * self.usd_price
    }

    /// Convert a USD figure to raw units of this token (floor).
    pub fn usd_to_raw(&self, usd: f64) -> U256 {
        if usd <= 0.0 || self.usd_price <= 0.0 {
            return U256::ZERO;
        }
        let units = usd / self.usd_price * 10f64.powi(self.decimals as i32);
        U256::from(units as u128)
    }
}

/// Dense handle into the venue registry. Venues come from configuration and
/// are frozen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VenueId(pub u16);

/// A DEX venue: one V2-style factory plus its swap fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    pub factory: Address,
    pub fee: FeeRate,
}

/// Immutable venue registry, index == `VenueId`.
#[derive(Debug, Clone, Default)]
pub struct VenueRegistry {
    venues: Vec<Venue>,
}

impl VenueRegistry {
    pub fn new(venues: Vec<Venue>) -> Self {
        Self { venues }
    }

    pub fn get(&self, id: VenueId) -> &Venue {
        &self.venues[id.0 as usize]
    }

    pub fn name(&self, id: VenueId) -> &str {
        &self.venues[id.0 as usize].name
    }

    pub fn by_name(&self, name: &str) -> Option<VenueId> {
        self.venues
            .iter()
            .position(|v| v.name == name)
            .map(|i| VenueId(i as u16))
    }

    pub fn ids(&self) -> impl Iterator<Item = VenueId> + '_ {
        (0..self.venues.len()).map(|i| VenueId(i as u16))
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }
}

/// Identity of a pool: venue plus the token pair in canonical order
/// (`token0 < token1` by raw address bytes, matching on-chain pair sorting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub venue: VenueId,
    pub token0: Address,
    pub token1: Address,
}

impl PairKey {
    /// Build a key, normalizing token order.
    pub fn new(venue: VenueId, a: Address, b: Address) -> Self {
        let (token0, token1) = if a <= b { (a, b) } else { (b, a) };
        Self {
            venue,
            token0,
            token1,
        }
    }

    /// The counterpart of `token` in this pair, if `token` is a member.
    pub fn other(&self, token: Address) -> Option<Address> {
        if token == self.token0 {
            Some(self.token1)
        } else if token == self.token1 {
            Some(self.token0)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}/{}", self.venue.0, self.token0, self.token1)
    }
}

/// Freshness of a reserve snapshot relative to the newest seen block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    /// Either reserve is zero; excluded from detection entirely.
    Dead,
}

/// One observation of a pool's reserves, anchored to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveSnapshot {
    pub pair: PairKey,
    /// Resolved pair contract address.
    pub address: Address,
    pub reserve0: U256,
    pub reserve1: U256,
    pub block_number: u64,
    pub block_hash: B256,
    pub observed_at: DateTime<Utc>,
}

impl ReserveSnapshot {
    pub fn is_dead(&self) -> bool {
        self.reserve0.is_zero() || self.reserve1.is_zero()
    }

    /// Reserves oriented for a swap entering with `token_in`.
    /// Returns `(reserve_in, reserve_out)`, or `None` if `token_in` is not
    /// a member of the pair.
    pub fn oriented(&self, token_in: Address) -> Option<(U256, U256)> {
        if token_in == self.pair.token0 {
            Some((self.reserve0, self.reserve1))
        } else if token_in == self.pair.token1 {
            Some((self.reserve1, self.reserve0))
        } else {
            None
        }
    }

    /// Reserve held in `token`, if `token` is a member of the pair.
    pub fn reserve_of(&self, token: Address) -> Option<U256> {
        if token == self.pair.token0 {
            Some(self.reserve0)
        } else if token == self.pair.token1 {
            Some(self.reserve1)
        } else {
            None
        }
    }
}

/// Kind of arbitrage cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityKind {
    TwoLeg,
    Triangular,
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpportunityKind::TwoLeg => write!(f, "two_leg"),
            OpportunityKind::Triangular => write!(f, "triangular"),
        }
    }
}

impl OpportunityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "two_leg" => Some(OpportunityKind::TwoLeg),
            "triangular" => Some(OpportunityKind::Triangular),
            _ => None,
        }
    }
}

/// Lifecycle of an opportunity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    Detected,
    Qualified,
    Rejected,
    Expired,
    SimulatedExecuted,
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OpportunityStatus::Detected => "detected",
            OpportunityStatus::Qualified => "qualified",
            OpportunityStatus::Rejected => "rejected",
            OpportunityStatus::Expired => "expired",
            OpportunityStatus::SimulatedExecuted => "simulated_executed",
        };
        write!(f, "{s}")
    }
}

impl OpportunityStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(OpportunityStatus::Detected),
            "qualified" => Some(OpportunityStatus::Qualified),
            "rejected" => Some(OpportunityStatus::Rejected),
            "expired" => Some(OpportunityStatus::Expired),
            "simulated_executed" => Some(OpportunityStatus::SimulatedExecuted),
            _ => None,
        }
    }
}

/// One hop of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub venue: VenueId,
    pub token_in: Address,
    pub token_out: Address,
}

/// Copy-on-read pool side for one leg, oriented `token_in -> token_out`.
/// Carried on candidates so the risk gate can re-price a different size
/// without another cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegPool {
    pub reserve_in: U256,
    pub reserve_out: U256,
    pub fee: FeeRate,
}

/// An arbitrage opportunity. The cycle identity is immutable once built;
/// only `status`, `reason` and `expires_at` are stamped as the record moves
/// through the pipeline.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: String,
    pub kind: OpportunityKind,
    pub legs: Vec<Leg>,
    /// Pool sides matching `legs`, oriented in trade direction.
    pub leg_pools: Vec<LegPool>,
    /// Input amount in raw units of leg 0's input token (the quote token).
    pub trade_amount_in: U256,
    pub quote_token: Address,
    pub gross_profit_quote: U256,
    pub net_profit_quote: U256,
    pub gas_cost_quote: U256,
    pub fee_cost_quote: U256,
    pub block_number: u64,
    pub block_hash: B256,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OpportunityStatus,
    pub reason: Option<String>,
}

impl Opportunity {
    /// Deterministic id from the cycle identity plus a monotonic counter.
    pub fn make_id(
        kind: OpportunityKind,
        legs: &[Leg],
        block_number: u64,
        counter: u64,
    ) -> String {
        let mut path = String::new();
        for leg in legs {
            path.push_str(&format!("{}-{}-", leg.venue.0, leg.token_in));
        }
        format!("{kind}:{path}{block_number}:{counter}")
    }

    /// `net_profit / max(1, gas_cost + fee_cost)`, all in quote raw units.
    pub fn margin(&self) -> f64 {
        let denom = (self.gas_cost_quote + self.fee_cost_quote).max(U256::from(1u8));
        ratio_f64(self.net_profit_quote, denom)
    }

    /// Venue names along the cycle, e.g. `uniswap>sushiswap`.
    pub fn venue_path(&self, venues: &VenueRegistry) -> String {
        self.legs
            .iter()
            .map(|l| venues.name(l.venue).to_string())
            .collect::<Vec<_>>()
            .join(">")
    }

    /// Token path of the cycle including the closing token.
    pub fn token_path(&self) -> String {
        let mut out: Vec<String> = self.legs.iter().map(|l| l.token_in.to_string()).collect();
        if let Some(last) = self.legs.last() {
            out.push(last.token_out.to_string());
        }
        out.join(">")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// `a / b` as f64, saturating instead of panicking on giant values.
/// For reporting only; never feeds back into integer math.
pub fn ratio_f64(a: U256, b: U256) -> f64 {
    let af = a.to_string().parse::<f64>().unwrap_or(f64::MAX);
    let bf = b.to_string().parse::<f64>().unwrap_or(f64::MAX);
    if bf == 0.0 {
        return 0.0;
    }
    af / bf
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const WETH: Address = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
    const USDC: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

    #[test]
    fn pair_key_normalizes_token_order() {
        let a = PairKey::new(VenueId(0), WETH, USDC);
        let b = PairKey::new(VenueId(0), USDC, WETH);
        assert_eq!(a, b);
        assert!(a.token0 < a.token1);
    }

    #[test]
    fn snapshot_orientation() {
        let key = PairKey::new(VenueId(0), WETH, USDC);
        let snap = ReserveSnapshot {
            pair: key,
            address: Address::ZERO,
            reserve0: U256::from(100u64),
            reserve1: U256::from(200u64),
            block_number: 1,
            block_hash: B256::ZERO,
            observed_at: Utc::now(),
        };
        // USDC < WETH by raw bytes, so USDC is token0.
        assert_eq!(
            snap.oriented(USDC),
            Some((U256::from(100u64), U256::from(200u64)))
        );
        assert_eq!(
            snap.oriented(WETH),
            Some((U256::from(200u64), U256::from(100u64)))
        );
        assert_eq!(snap.oriented(Address::ZERO), None);
    }

    #[test]
    fn dead_snapshot_detection() {
        let key = PairKey::new(VenueId(0), WETH, USDC);
        let snap = ReserveSnapshot {
            pair: key,
            address: Address::ZERO,
            reserve0: U256::ZERO,
            reserve1: U256::from(200u64),
            block_number: 1,
            block_hash: B256::ZERO,
            observed_at: Utc::now(),
        };
        assert!(snap.is_dead());
    }

    #[test]
    fn deterministic_ids_differ_by_counter() {
        let legs = [Leg {
            venue: VenueId(1),
            token_in: WETH,
            token_out: USDC,
        }];
        let a = Opportunity::make_id(OpportunityKind::TwoLeg, &legs, 100, 0);
        let b = Opportunity::make_id(OpportunityKind::TwoLeg, &legs, 100, 1);
        assert_ne!(a, b);
        assert!(a.starts_with("two_leg:"));
    }

    #[test]
    fn token_usd_round_trip() {
        let usdc = Token {
            address: USDC,
            symbol: "USDC".into(),
            decimals: 6,
            usd_price: 1.0,
        };
        assert_eq!(usdc.usd_to_raw(10.0), U256::from(10_000_000u64));
        assert!((usdc.raw_to_usd(U256::from(10_000_000u64)) - 10.0).abs() < 1e-9);
    }
}
