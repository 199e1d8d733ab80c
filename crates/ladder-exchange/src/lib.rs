//! Exchange access for the ladder trading bot.
//!
//! Provides the `ExchangeClient` trait, a signed REST implementation,
//! the HMAC request signer, the classified error taxonomy, and the
//! bounded-retry executor used by every remote call.

pub mod client;
pub mod error;
pub mod retry;
pub mod signer;

pub use client::{
    AccountInfo, BoxFuture, ExchangeClient, OpenOrder, OrderReceipt, OrderSpec, QuoteSource,
    RestClientConfig, RestExchangeClient, Ticker,
};
pub use error::{ExchangeError, ExchangeResult};
pub use retry::RetryExecutor;
pub use signer::{canonical_query, RequestSigner};
