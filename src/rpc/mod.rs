//! Chain transport: a pool of JSON-RPC endpoints with failover.

mod pool;

pub use pool::{BlockHead, RpcPool};
