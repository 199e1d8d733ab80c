//! Canonical price feed for the ladder trading bot.
//!
//! Produces a single stream of `PriceUpdate` values for one symbol,
//! abstracting over transport: normalized stream data first, REST
//! polling when the stream is stale, the last known price as a final
//! fallback.

pub mod error;
pub mod feed;
pub mod normalize;
pub mod shared;

pub use error::{FeedError, FeedResult};
pub use feed::{PriceFeed, PriceFeedConfig, PriceFeedHandle};
pub use normalize::{NormalizedTick, Normalizer};
pub use shared::SharedPrice;
