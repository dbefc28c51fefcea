//! Configuration loading and validation.
//!
//! A single TOML document describes endpoints, venues, tokens, monitored
//! pairs, triangular cycles and every engine threshold. `FileConfig` is the
//! raw serde shape; `AppConfig::resolve` cross-checks references (every pair
//! and cycle token must be declared with its decimals) and freezes the venue
//! registry. Any inconsistency is a fatal `ConfigError`.

use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{FeeRate, Token, Venue, VenueRegistry};

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub venues: Vec<VenueConfig>,
    pub tokens: Vec<TokenConfig>,
    #[serde(default, rename = "pair")]
    pub pairs: Vec<PairConfig>,
    #[serde(default, rename = "cycle")]
    pub cycles: Vec<CycleConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_weight() -> u32 {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    10_000
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    pub factory: String,
    #[serde(default = "default_fee_num")]
    pub fee_num: u32,
    #[serde(default = "default_fee_den")]
    pub fee_den: u32,
}

fn default_fee_num() -> u32 {
    997
}
fn default_fee_den() -> u32 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    /// Reference USD price for risk accounting and display.
    pub usd_price: f64,
}

/// A monitored pair, tokens referenced by symbol. `quote` names the token
/// the round trip starts and ends in; profit is reported in its raw units.
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
    /// Per-pair cap in USD; falls back to `engine.max_position_usd`.
    pub max_position_usd: Option<f64>,
}

/// A triangular cycle. `tokens` is the traversal order starting and ending
/// at the quote token (`tokens[0]`).
#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    pub tokens: Vec<String>,
    pub max_position_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub min_profit_usd: f64,
    pub min_margin: f64,
    pub safety_margin: f64,
    pub max_position_usd: f64,
    pub gas_buffer: f64,
    pub max_gas_price_gwei: u64,
    pub min_liquidity_usd: f64,
    pub max_price_impact: f64,
    pub opportunity_timeout_secs: u64,
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    pub stagger_delay_ms: u64,
    pub cache_ttl_secs: u64,
    pub negative_cache_ttl_secs: u64,
    pub max_block_skew: u64,
    pub max_opportunities_per_block: usize,
    pub emit_rejected: bool,
    pub gas_estimate_two_leg: u64,
    pub gas_estimate_triangular: u64,
    /// Native (gas) token, by symbol from `[tokens]`.
    pub native_token: String,
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_profit_usd: 10.0,
            min_margin: 0.005,
            safety_margin: 0.1,
            max_position_usd: 10_000.0,
            gas_buffer: 1.2,
            max_gas_price_gwei: 500,
            min_liquidity_usd: 50_000.0,
            max_price_impact: 0.005,
            opportunity_timeout_secs: 30,
            scan_interval_secs: 5,
            batch_size: 25,
            stagger_delay_ms: 100,
            cache_ttl_secs: 30,
            negative_cache_ttl_secs: 10,
            max_block_skew: 1,
            max_opportunities_per_block: 3,
            emit_rejected: true,
            gas_estimate_two_leg: 200_000,
            gas_estimate_triangular: 300_000,
            native_token: "WETH".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn min_margin_ppm(&self) -> u64 {
        (self.min_margin * 1e6) as u64
    }

    pub fn max_price_impact_ppm(&self) -> u64 {
        (self.max_price_impact * 1e6) as u64
    }

    /// Safety haircut in parts-per-million of profit retained.
    pub fn safety_keep_ppm(&self) -> u64 {
        ((1.0 - self.safety_margin).clamp(0.0, 1.0) * 1e6) as u64
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub failover_threshold: u32,
    pub cooldown_secs: u64,
    pub unhealthy_after_secs: u64,
    pub resubscribe_delay_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            failover_threshold: 3,
            cooldown_secs: 60,
            unhealthy_after_secs: 30,
            resubscribe_delay_ms: 1_000,
        }
    }
}

impl RpcConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub available_capital_usd: f64,
    pub max_portfolio_exposure: f64,
    pub max_daily_loss_usd: f64,
    pub max_drawdown: f64,
    pub max_concurrent_positions: usize,
    pub assumed_loss_fraction: f64,
    pub min_position_usd: f64,
    pub max_position_usd: f64,
    pub kelly_fraction: f64,
    /// Wall-clock hour (UTC) at which daily P&L resets.
    pub daily_reset_hour_utc: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            available_capital_usd: 100_000.0,
            max_portfolio_exposure: 0.5,
            max_daily_loss_usd: 1_000.0,
            max_drawdown: 0.2,
            max_concurrent_positions: 3,
            assumed_loss_fraction: 0.1,
            min_position_usd: 10.0,
            max_position_usd: 10_000.0,
            kelly_fraction: 0.25,
            daily_reset_hour_utc: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub buffer_limit: usize,
    pub outage_max_secs: u64,
    pub record_price_history: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "arbscan.db".to_string(),
            buffer_limit: 10_000,
            outage_max_secs: 60,
            record_price_history: true,
        }
    }
}

impl StoreConfig {
    pub fn outage_max(&self) -> Duration {
        Duration::from_secs(self.outage_max_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// A monitored pair after symbol resolution.
#[derive(Debug, Clone)]
pub struct MonitoredPair {
    pub base: Address,
    pub quote: Address,
    pub max_position_usd: f64,
}

/// A triangular cycle after symbol resolution. `tokens[0]` is the quote.
#[derive(Debug, Clone)]
pub struct TriangularCycle {
    pub tokens: [Address; 3],
    pub max_position_usd: f64,
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub venues: VenueRegistry,
    pub tokens: HashMap<Address, Token>,
    pub pairs: Vec<MonitoredPair>,
    pub cycles: Vec<TriangularCycle>,
    pub native_token: Address,
    pub engine: EngineConfig,
    pub rpc: RpcConfig,
    pub risk: RiskConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

impl AppConfig {
    /// Load and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let raw: FileConfig = toml::from_str(&content)?;
        Self::resolve(raw)
    }

    pub fn resolve(raw: FileConfig) -> Result<Self, ConfigError> {
        if raw.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one endpoint is required".into()));
        }
        if raw.venues.len() < 2 {
            return Err(ConfigError::Invalid(
                "at least two venues are required for cross-venue detection".into(),
            ));
        }

        let mut venues = Vec::with_capacity(raw.venues.len());
        for v in &raw.venues {
            if v.fee_num == 0 || v.fee_den == 0 || v.fee_num >= v.fee_den {
                return Err(ConfigError::Invalid(format!(
                    "venue {}: fee {}/{} is not a valid swap fee",
                    v.name, v.fee_num, v.fee_den
                )));
            }
            venues.push(Venue {
                name: v.name.clone(),
                factory: parse_address(&v.factory, &format!("venue {} factory", v.name))?,
                fee: FeeRate::new(v.fee_num, v.fee_den),
            });
        }
        let venues = VenueRegistry::new(venues);

        let mut tokens = HashMap::new();
        let mut by_symbol: HashMap<String, Address> = HashMap::new();
        for t in &raw.tokens {
            let address = parse_address(&t.address, &format!("token {}", t.symbol))?;
            if t.decimals > 36 {
                return Err(ConfigError::Invalid(format!(
                    "token {}: implausible decimals {}",
                    t.symbol, t.decimals
                )));
            }
            if t.usd_price <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "token {}: usd_price must be positive",
                    t.symbol
                )));
            }
            by_symbol.insert(t.symbol.clone(), address);
            tokens.insert(
                address,
                Token {
                    address,
                    symbol: t.symbol.clone(),
                    decimals: t.decimals,
                    usd_price: t.usd_price,
                },
            );
        }

        let lookup = |symbol: &str, context: &str| -> Result<Address, ConfigError> {
            by_symbol.get(symbol).copied().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "{context} references token {symbol} with no [[tokens]] entry (decimals unknown)"
                ))
            })
        };

        let mut pairs = Vec::with_capacity(raw.pairs.len());
        for p in &raw.pairs {
            let base = lookup(&p.base, "pair")?;
            let quote = lookup(&p.quote, "pair")?;
            if base == quote {
                return Err(ConfigError::Invalid(format!(
                    "pair {}/{} uses the same token on both sides",
                    p.base, p.quote
                )));
            }
            pairs.push(MonitoredPair {
                base,
                quote,
                max_position_usd: p.max_position_usd.unwrap_or(raw.engine.max_position_usd),
            });
        }

        let mut cycles = Vec::with_capacity(raw.cycles.len());
        for c in &raw.cycles {
            if c.tokens.len() != 3 {
                return Err(ConfigError::Invalid(format!(
                    "cycle must name exactly three tokens, got {}",
                    c.tokens.len()
                )));
            }
            let a = lookup(&c.tokens[0], "cycle")?;
            let b = lookup(&c.tokens[1], "cycle")?;
            let d = lookup(&c.tokens[2], "cycle")?;
            if a == b || b == d || a == d {
                return Err(ConfigError::Invalid(
                    "cycle tokens must be pairwise distinct".into(),
                ));
            }
            cycles.push(TriangularCycle {
                tokens: [a, b, d],
                max_position_usd: c.max_position_usd.unwrap_or(raw.engine.max_position_usd),
            });
        }

        if pairs.is_empty() && cycles.is_empty() {
            return Err(ConfigError::Invalid(
                "nothing to monitor: configure at least one [[pair]] or [[cycle]]".into(),
            ));
        }

        let native_token = lookup(&raw.engine.native_token, "engine.native_token")?;

        Ok(Self {
            endpoints: raw.endpoints,
            venues,
            tokens,
            pairs,
            cycles,
            native_token,
            engine: raw.engine,
            rpc: raw.rpc,
            risk: raw.risk,
            store: raw.store,
            api: raw.api,
        })
    }

    pub fn token(&self, address: Address) -> Option<&Token> {
        self.tokens.get(&address)
    }
}

fn parse_address(s: &str, context: &str) -> Result<Address, ConfigError> {
    Address::from_str(s)
        .map_err(|e| ConfigError::Invalid(format!("{context}: bad address {s}: {e}")))
}
