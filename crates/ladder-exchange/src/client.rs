//! Exchange client trait and REST implementation.
//!
//! The trait abstracts the exchange surface the trading cycle needs,
//! allowing unit tests to substitute scripted implementations. The REST
//! implementation signs requests with HMAC-SHA256 over the canonical
//! query string and classifies failures into the recovery taxonomy.

use crate::error::{ExchangeError, ExchangeResult};
use crate::signer::{canonical_query, RequestSigner};
use ladder_core::{ClientOrderId, OrderSide, OrderStatus, OrderType, Position, PositionSide, Price, Size};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ticker snapshot for one symbol.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Price,
}

/// Specification of an order to submit.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: Size,
    /// Required for limit orders, absent for market orders.
    pub price: Option<Price>,
    pub client_order_id: ClientOrderId,
    pub reduce_only: bool,
}

impl OrderSpec {
    /// Limit entry order for one ladder rung.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        position_side: PositionSide,
        quantity: Size,
        price: Price,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            position_side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            client_order_id: ClientOrderId::new(),
            reduce_only: false,
        }
    }

    /// Market order flattening the full position quantity.
    pub fn market_close(
        symbol: impl Into<String>,
        position_side: PositionSide,
        quantity: Size,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: position_side.exit_side(),
            position_side,
            order_type: OrderType::Market,
            quantity: quantity.abs(),
            price: None,
            client_order_id: ClientOrderId::new(),
            reduce_only: true,
        }
    }
}

/// Result of order submission.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
    pub client_order_id: Option<ClientOrderId>,
    pub status: OrderStatus,
}

/// An order resting on the book.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: Size,
}

/// Account balance summary.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
}

/// Exchange operations required by the trading cycle.
///
/// Dyn-compatible via boxed futures so controllers and tests can share
/// `Arc<dyn ExchangeClient>`.
pub trait ExchangeClient: Send + Sync {
    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>>;

    fn get_positions<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Vec<Position>>>;

    fn create_order<'a>(&'a self, spec: &'a OrderSpec) -> BoxFuture<'a, ExchangeResult<OrderReceipt>>;

    fn get_open_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Vec<OpenOrder>>>;

    fn cancel_all_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<()>>;

    fn get_account_info(&self) -> BoxFuture<'_, ExchangeResult<AccountInfo>>;

    fn set_leverage<'a>(&'a self, symbol: &'a str, leverage: u32) -> BoxFuture<'a, ExchangeResult<()>>;
}

/// Plain price source abstraction for the feed's REST fallback.
///
/// Separate from `ExchangeClient` so a secondary quote endpoint can be
/// plugged in without implementing the full trading surface.
pub trait QuoteSource: Send + Sync {
    fn fetch_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Price>>;
}

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Base URL (e.g., "https://fapi.example.com").
    pub base_url: String,
    /// API key sent in the auth header.
    pub api_key: String,
    /// Signature receive window.
    pub recv_window_ms: u64,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            recv_window_ms: 5000,
            timeout_ms: 10000,
        }
    }
}

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Signed REST implementation of `ExchangeClient`.
pub struct RestExchangeClient {
    http: reqwest::Client,
    config: RestClientConfig,
    signer: RequestSigner,
}

impl RestExchangeClient {
    pub fn new(config: RestClientConfig, signer: RequestSigner) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ExchangeError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Append timestamp, receive window, and signature to request params.
    fn sign_params(&self, mut params: Vec<(&'static str, String)>) -> String {
        let timestamp = chrono::Utc::now().timestamp_millis();
        params.push(("recvWindow", self.config.recv_window_ms.to_string()));
        params.push(("timestamp", timestamp.to_string()));
        let canonical = canonical_query(&params);
        let signature = self.signer.sign(&canonical);
        format!("{canonical}&signature={signature}")
    }

    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(&'static str, String)>,
    ) -> ExchangeResult<T> {
        let query = self.sign_params(params);
        let url = format!("{}?{}", self.url(path), query);

        let response = self
            .http
            .request(method, &url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let (code, message) = parse_api_error(&body);
            return Err(ExchangeError::classify(status.as_u16(), code, message));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("{e}: {}", truncate(&body, 200))))
    }
}

impl ExchangeClient for RestExchangeClient {
    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>> {
        Box::pin(async move {
            let url = format!("{}?symbol={}", self.url("/fapi/v1/ticker/price"), symbol);
            let response = self.http.get(&url).send().await?;
            let raw: TickerResponse = Self::handle_response(response).await?;

            let last_price = parse_price(&raw.price)?;
            debug!(symbol = %raw.symbol, price = %last_price, "Fetched ticker");
            Ok(Ticker {
                symbol: raw.symbol,
                last_price,
            })
        })
    }

    fn get_positions<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Vec<Position>>> {
        Box::pin(async move {
            let params = vec![("symbol", symbol.to_string())];
            let raw: Vec<PositionEntry> = self
                .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", params)
                .await?;
            parse_positions(raw)
        })
    }

    fn create_order<'a>(&'a self, spec: &'a OrderSpec) -> BoxFuture<'a, ExchangeResult<OrderReceipt>> {
        Box::pin(async move {
            let params = order_params(spec);
            let raw: OrderResponse = self
                .send_signed(reqwest::Method::POST, "/fapi/v1/order", params)
                .await?;

            info!(
                order_id = raw.order_id,
                status = ?raw.status,
                symbol = %spec.symbol,
                side = %spec.side,
                "Order submitted"
            );
            Ok(OrderReceipt {
                order_id: raw.order_id.to_string(),
                client_order_id: raw.client_order_id.map(ClientOrderId::from_string),
                status: raw.status,
            })
        })
    }

    fn get_open_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Vec<OpenOrder>>> {
        Box::pin(async move {
            let params = vec![("symbol", symbol.to_string())];
            let raw: Vec<OpenOrderEntry> = self
                .send_signed(reqwest::Method::GET, "/fapi/v1/openOrders", params)
                .await?;
            raw.into_iter().map(parse_open_order).collect()
        })
    }

    fn cancel_all_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let params = vec![("symbol", symbol.to_string())];
            let _: serde_json::Value = self
                .send_signed(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", params)
                .await?;
            info!(symbol, "Cancelled all open orders");
            Ok(())
        })
    }

    fn get_account_info(&self) -> BoxFuture<'_, ExchangeResult<AccountInfo>> {
        Box::pin(async move {
            let raw: AccountResponse = self
                .send_signed(reqwest::Method::GET, "/fapi/v2/account", Vec::new())
                .await?;

            Ok(AccountInfo {
                total_balance: parse_decimal(&raw.total_wallet_balance)?,
                available_balance: parse_decimal(&raw.available_balance)?,
            })
        })
    }

    fn set_leverage<'a>(&'a self, symbol: &'a str, leverage: u32) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let params = vec![
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ];
            let _: serde_json::Value = self
                .send_signed(reqwest::Method::POST, "/fapi/v1/leverage", params)
                .await?;
            info!(symbol, leverage, "Leverage configured");
            Ok(())
        })
    }
}

impl QuoteSource for RestExchangeClient {
    fn fetch_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Price>> {
        Box::pin(async move { Ok(self.get_ticker(symbol).await?.last_price) })
    }
}

// ============================================================================
// Wire types and parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "unRealizedProfit", default)]
    unrealized_profit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId", default)]
    client_order_id: Option<String>,
    status: OrderStatus,
}

#[derive(Debug, Deserialize)]
struct OpenOrderEntry {
    #[serde(rename = "orderId")]
    order_id: u64,
    symbol: String,
    side: String,
    price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(rename = "totalWalletBalance")]
    total_wallet_balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

fn parse_api_error(body: &str) -> (i64, String) {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.msg.is_empty() => (parsed.code, parsed.msg),
        _ => (0, truncate(body, 200).to_string()),
    }
}

fn parse_decimal(s: &str) -> ExchangeResult<Decimal> {
    s.parse()
        .map_err(|e| ExchangeError::Parse(format!("bad decimal {s:?}: {e}")))
}

fn parse_price(s: &str) -> ExchangeResult<Price> {
    Ok(Price::new(parse_decimal(s)?))
}

fn parse_side(s: &str) -> ExchangeResult<OrderSide> {
    match s {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(ExchangeError::Parse(format!("unknown side {other:?}"))),
    }
}

fn venue_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn venue_order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
    }
}

/// Build the signed parameter list for an order submission.
fn order_params(spec: &OrderSpec) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", spec.symbol.clone()),
        ("side", venue_side(spec.side).to_string()),
        ("type", venue_order_type(spec.order_type).to_string()),
        ("quantity", spec.quantity.to_string()),
        ("newClientOrderId", spec.client_order_id.to_string()),
    ];

    if let Some(price) = spec.price {
        params.push(("price", price.to_string()));
        params.push(("timeInForce", "GTC".to_string()));
    }
    if spec.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }

    params
}

/// Convert raw position entries to snapshots, dropping flat entries.
///
/// The venue reports one entry per symbol with a signed amount; the
/// sign carries the direction.
fn parse_positions(raw: Vec<PositionEntry>) -> ExchangeResult<Vec<Position>> {
    let mut positions = Vec::new();

    for entry in raw {
        let amount = parse_decimal(&entry.position_amt)?;
        if amount.is_zero() {
            continue;
        }

        let side = if amount.is_sign_positive() {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let unrealized = entry
            .unrealized_profit
            .as_deref()
            .map(parse_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);

        positions.push(Position::new(
            side,
            Size::new(amount.abs()),
            parse_price(&entry.entry_price)?,
            unrealized,
        ));
    }

    Ok(positions)
}

fn parse_open_order(entry: OpenOrderEntry) -> ExchangeResult<OpenOrder> {
    Ok(OpenOrder {
        order_id: entry.order_id.to_string(),
        symbol: entry.symbol,
        side: parse_side(&entry.side)?,
        price: parse_price(&entry.price)?,
        quantity: Size::new(parse_decimal(&entry.orig_qty)?),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
