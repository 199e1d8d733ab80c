//! Wire message types for the market-data stream.
//!
//! The exchange protocol is generalized to subscribe/ping-pong/ticker
//! events; concrete payload normalization lives in the feed crate. This
//! module only extracts the parts the connection manager itself needs:
//! subscription acknowledgements and server-assigned event identities
//! used for duplicate suppression.

use serde::Serialize;
use serde_json::Value;

/// Outbound subscription request.
///
/// Shape: `{"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}`.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    pub id: u64,
}

impl WsRequest {
    /// Create a subscribe request for a stream name.
    pub fn subscribe(stream: impl Into<String>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE".to_string(),
            params: vec![stream.into()],
            id,
        }
    }

    /// Create an unsubscribe request for a stream name.
    pub fn unsubscribe(stream: impl Into<String>, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE".to_string(),
            params: vec![stream.into()],
            id,
        }
    }
}

/// Server-assigned identity of a market-data event.
///
/// Dedup key components: event source (channel/type name), symbol, and
/// the server's event timestamp. Two payloads with the same identity are
/// the same event regardless of which connection delivered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentity {
    pub source: String,
    pub symbol: String,
    pub server_time: i64,
}

impl EventIdentity {
    /// Extract an identity from a raw payload, if it carries one.
    ///
    /// Tolerates the field namings observed across venues: compact
    /// (`e`/`s`/`E`) and verbose (`type`/`symbol`/`ts`), with the event
    /// body possibly nested under `data`.
    pub fn extract(payload: &Value) -> Option<Self> {
        let body = payload.get("data").unwrap_or(payload);

        let source = string_field(body, &["e", "type", "channel"])?;
        let symbol = string_field(body, &["s", "symbol"])?;
        let server_time = int_field(body, &["E", "ts", "eventTime"])?;

        Some(Self {
            source,
            symbol,
            server_time,
        })
    }

    /// Dedup cache key for this identity.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.symbol, self.server_time)
    }
}

fn string_field(body: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| body.get(*n).and_then(Value::as_str))
        .map(str::to_string)
}

fn int_field(body: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|n| body.get(*n).and_then(Value::as_i64))
}

/// A deduplicated inbound event forwarded to the feed.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Id of the connection that delivered the event.
    pub connection_id: u64,
    /// Server identity, when the payload carried one.
    pub identity: Option<EventIdentity>,
    /// Raw payload for downstream normalization.
    pub payload: Value,
}

/// Check whether a payload is a subscription acknowledgement.
///
/// Acks look like `{"result": null, "id": 1}` or carry an explicit
/// `"method"` echo; they are consumed by the connection manager and
/// never forwarded downstream.
pub fn is_subscription_ack(payload: &Value) -> bool {
    if payload.get("id").is_some() && payload.get("result").is_some() {
        return true;
    }
    payload
        .get("method")
        .and_then(Value::as_str)
        .is_some_and(|m| m.eq_ignore_ascii_case("subscribe"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_request_shape() {
        let req = WsRequest::subscribe("btcusdt@ticker", 7);
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains("\"SUBSCRIBE\""));
        assert!(text.contains("btcusdt@ticker"));
        assert!(text.contains("\"id\":7"));
    }

    #[test]
    fn test_identity_compact_fields() {
        let payload = json!({"e": "24hrTicker", "s": "BTCUSDT", "E": 1700000000123i64, "c": "50000"});
        let id = EventIdentity::extract(&payload).unwrap();
        assert_eq!(id.source, "24hrTicker");
        assert_eq!(id.symbol, "BTCUSDT");
        assert_eq!(id.server_time, 1700000000123);
        assert_eq!(id.dedup_key(), "24hrTicker:BTCUSDT:1700000000123");
    }

    #[test]
    fn test_identity_verbose_fields() {
        let payload = json!({"type": "ticker", "symbol": "ETHUSDT", "ts": 42});
        let id = EventIdentity::extract(&payload).unwrap();
        assert_eq!(id.source, "ticker");
        assert_eq!(id.symbol, "ETHUSDT");
    }

    #[test]
    fn test_identity_nested_data() {
        let payload = json!({"data": {"e": "ticker", "s": "BTCUSDT", "E": 99}});
        assert!(EventIdentity::extract(&payload).is_some());
    }

    #[test]
    fn test_identity_missing_fields() {
        let payload = json!({"price": "50000"});
        assert!(EventIdentity::extract(&payload).is_none());
    }

    #[test]
    fn test_subscription_ack_detection() {
        assert!(is_subscription_ack(&json!({"result": null, "id": 1})));
        assert!(is_subscription_ack(&json!({"method": "subscribe", "id": 2})));
        assert!(!is_subscription_ack(&json!({"e": "ticker", "s": "BTCUSDT", "E": 1})));
    }
}
