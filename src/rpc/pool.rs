//! Multi-endpoint RPC transport.
//!
//! One ordered endpoint list; all traffic goes through the currently active
//! endpoint. After `failover_threshold` consecutive failures the pool
//! rotates to the next endpoint, rate-limited by `cooldown_period` so a
//! flapping endpoint cannot thrash the rotation. Every typed helper goes
//! through `call` and therefore inherits retry and failover.

use alloy::eips::BlockId;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use alloy::transports::TransportError;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, RpcConfig};
use crate::contracts::{IUniswapV2Factory, IUniswapV2Pair};
use crate::error::RpcError;
use crate::stats::Stats;

/// A new-heads notification, reduced to what the refresh pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub hash: B256,
}

struct Endpoint {
    config: EndpointConfig,
    /// Lazily connected; dropped on connection failure so the next attempt
    /// redials.
    provider: AsyncMutex<Option<DynProvider>>,
}

pub struct RpcPool {
    endpoints: Vec<Endpoint>,
    active: AtomicUsize,
    consecutive_failures: AtomicU32,
    last_rotation: Mutex<Option<Instant>>,
    config: RpcConfig,
    stats: Arc<Stats>,
}

impl RpcPool {
    pub fn new(endpoints: Vec<EndpointConfig>, config: RpcConfig, stats: Arc<Stats>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|config| Endpoint {
                config,
                provider: AsyncMutex::new(None),
            })
            .collect();
        Self {
            endpoints,
            active: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_rotation: Mutex::new(None),
            config,
            stats,
        }
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run `op` against the active endpoint, retrying up to one attempt per
    /// configured endpoint. Each attempt races the endpoint's timeout; a
    /// timeout counts as a failure like any transport error.
    pub async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T, RpcError>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.endpoints.len().max(1) as u32;
        let mut failures_on_active = 0u32;
        let mut last: Option<RpcError> = None;

        for _ in 0..max_attempts {
            let index = self.active_index();
            let timeout = self.endpoints[index].config.timeout();

            let error = match self.provider(index).await {
                Ok(provider) => match tokio::time::timeout(timeout, op(provider)).await {
                    Ok(Ok(value)) => {
                        self.note_success();
                        return Ok(value);
                    }
                    Ok(Err(e)) => classify(e),
                    Err(_) => RpcError::Timeout(timeout),
                },
                Err(e) => e,
            };

            debug!(%label, endpoint = index, error = %error, "rpc attempt failed");
            self.note_failure(index).await;

            if self.active_index() == index {
                failures_on_active += 1;
                if failures_on_active >= self.endpoints[index].config.max_retries {
                    // This endpoint is burning the whole attempt budget of a
                    // live call; rotate now regardless of cooldown.
                    self.rotate(index);
                    failures_on_active = 0;
                }
            } else {
                failures_on_active = 0;
            }

            last = Some(error);
        }

        Err(RpcError::Exhausted {
            attempts: max_attempts,
            last: last.map(|e| e.to_string()).unwrap_or_else(|| "no attempts".into()),
        })
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.call("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
    }

    pub async fn get_gas_price(&self) -> Result<u128, RpcError> {
        self.call("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    /// Factory lookup `getPair(tokenA, tokenB)`. The zero address means the
    /// factory has no pool for the pair.
    pub async fn get_pair_address(
        &self,
        factory: Address,
        token_a: Address,
        token_b: Address,
    ) -> Result<Address, RpcError> {
        let data = Bytes::from(
            IUniswapV2Factory::getPairCall {
                tokenA: token_a,
                tokenB: token_b,
            }
            .abi_encode(),
        );

        let bytes = self
            .call("factory.getPair", move |p| {
                let tx = TransactionRequest::default()
                    .with_to(factory)
                    .with_input(data.clone());
                async move { p.call(tx).await }
            })
            .await?;

        IUniswapV2Factory::getPairCall::abi_decode_returns(&bytes)
            .map_err(|e| RpcError::Malformed(format!("getPair return: {e}")))
    }

    /// `getReserves()` on a pair contract, pinned to `block`.
    pub async fn get_reserves(&self, pair: Address, block: u64) -> Result<(U256, U256), RpcError> {
        let data = Bytes::from(IUniswapV2Pair::getReservesCall {}.abi_encode());

        let bytes = self
            .call("pair.getReserves", move |p| {
                let tx = TransactionRequest::default()
                    .with_to(pair)
                    .with_input(data.clone());
                async move { p.call(tx).block(BlockId::number(block)).await }
            })
            .await?;

        let ret = IUniswapV2Pair::getReservesCall::abi_decode_returns(&bytes)
            .map_err(|e| RpcError::Malformed(format!("getReserves return: {e}")))?;

        Ok((
            U256::from(ret.reserve0.to::<u128>()),
            U256::from(ret.reserve1.to::<u128>()),
        ))
    }

    /// Reserves for many pairs at one block. Fans out concurrently and
    /// collects per-item results in request order; the batch as a whole only
    /// fails if every sub-call fails, which callers can see from the items.
    pub async fn get_reserves_batch(
        &self,
        pairs: &[Address],
        block: u64,
    ) -> Vec<Result<(U256, U256), RpcError>> {
        join_all(pairs.iter().map(|pair| self.get_reserves(*pair, block))).await
    }

    /// Subscribe to new block headers on the active endpoint. Returns a
    /// stream that ends when the transport drops; callers re-subscribe
    /// through the pool, which will have rotated the endpoint by then.
    pub async fn subscribe_blocks(
        &self,
    ) -> Result<impl Stream<Item = BlockHead> + Send + Unpin, RpcError> {
        let index = self.active_index();
        let provider = self.provider(index).await?;

        match provider.subscribe_blocks().await {
            Ok(sub) => {
                self.note_success();
                info!(endpoint = index, "block subscription established");
                Ok(sub
                    .into_stream()
                    .map(|header| BlockHead {
                        number: header.number,
                        hash: header.hash,
                    })
                    .boxed())
            }
            Err(e) => {
                let error = classify(e);
                self.note_failure(index).await;
                Err(error)
            }
        }
    }

    async fn provider(&self, index: usize) -> Result<DynProvider, RpcError> {
        let endpoint = &self.endpoints[index];
        let mut slot = endpoint.provider.lock().await;
        if let Some(provider) = slot.as_ref() {
            return Ok(provider.clone());
        }

        let url = &endpoint.config.url;
        debug!(endpoint = index, %url, "connecting rpc provider");
        let connected = tokio::time::timeout(
            endpoint.config.timeout(),
            ProviderBuilder::new().connect(url),
        )
        .await
        .map_err(|_| RpcError::Timeout(endpoint.config.timeout()))?
        .map_err(|e| RpcError::Refused(e.to_string()))?;

        let provider = connected.erased();
        *slot = Some(provider.clone());
        Ok(provider)
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    async fn note_failure(&self, index: usize) {
        self.stats.record_endpoint_error(index);
        // Drop the cached provider so the next attempt redials.
        *self.endpoints[index].provider.lock().await = None;

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.failover_threshold {
            let cooled = {
                let guard = self.last_rotation.lock().unwrap_or_else(|e| e.into_inner());
                guard.map_or(true, |at| at.elapsed() >= self.config.cooldown())
            };
            if cooled {
                self.rotate(index);
            }
        }
    }

    /// Rotate away from `from` if it is still the active endpoint.
    fn rotate(&self, from: usize) {
        let next = (from + 1) % self.endpoints.len();
        if self
            .active
            .compare_exchange(from, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            *self.last_rotation.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            self.stats.set_endpoint_index(next);
            warn!(from, to = next, "rotated rpc endpoint");
        }
    }
}

fn classify(error: TransportError) -> RpcError {
    match error {
        TransportError::DeserError { err, .. } => RpcError::Malformed(err.to_string()),
        TransportError::SerError(err) => RpcError::Malformed(err.to_string()),
        TransportError::ErrorResp(payload) => RpcError::Malformed(payload.to_string()),
        TransportError::NullResp => RpcError::Malformed("null response".into()),
        TransportError::UnsupportedFeature(feature) => {
            RpcError::NoSubscriptionTransport(feature.to_string())
        }
        TransportError::LocalUsageError(err) => RpcError::Refused(err.to_string()),
        TransportError::Transport(kind) => RpcError::Refused(kind.to_string()),
    }
}
