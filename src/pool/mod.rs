//! Pool state: pair/snapshot caching and the block-driven price feed.

pub mod cache;
pub mod feed;

pub use cache::PairCache;
pub use feed::{FeedState, FeedTick, PriceFeed};
