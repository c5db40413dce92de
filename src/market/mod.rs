//! Market data: live aggregation and the DEX token stream.

pub mod aggregator;
pub mod stream;

pub use aggregator::{MarketAggregator, TokenState, WHALE_THRESHOLD_MON};
pub use stream::TokenStream;
