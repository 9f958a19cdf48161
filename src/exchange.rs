// =============================================================================
// Exchange Order Gateway — signed REST client + simulated fills
// =============================================================================
//
// The Guard talks to the exchange through the `OrderGateway` trait. Two
// implementations ship here:
//
//   - `RestGateway` — HMAC-SHA256 signed REST client. HTTP 4xx responses map
//     to fatal errors (do not retry); 5xx, 429, and transport failures map
//     to transient errors (retry within budget).
//   - `SimGateway` — local fill simulation for demo mode and tests.
//
// SECURITY: the secret key is never logged or serialized.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancelled.
    Gtc,
    /// Immediate-or-cancel: fill what crosses now, cancel the rest.
    Ioc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    /// IOC order found no liquidity at or above the limit price.
    Expired,
    Rejected,
}

/// Execution report for a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    /// Quantity actually filled (0 for an expired IOC).
    pub filled: f64,
    /// Volume-weighted average fill price (0 when nothing filled).
    pub avg_price: f64,
    /// Commission charged, in `fee_asset`.
    pub fee: f64,
    pub fee_asset: String,
    pub status: OrderStatus,
}

impl OrderFill {
    pub fn is_filled(&self) -> bool {
        self.filled > 0.0 && matches!(self.status, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Exchange failure classes. `Transient` is retried within the budget;
/// `Fatal` (validation/balance rejections) short-circuits immediately.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Fee schedule
// ---------------------------------------------------------------------------

/// Taker fee lookup: symbol-specific rate, falling back to the account-level
/// rate, falling back to the static default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    #[serde(default)]
    pub symbol_rates: HashMap<String, f64>,
    #[serde(default)]
    pub account_rate: Option<f64>,
    pub default_rate: f64,
}

impl FeeSchedule {
    pub fn flat(default_rate: f64) -> Self {
        Self {
            symbol_rates: HashMap::new(),
            account_rate: None,
            default_rate,
        }
    }

    /// Best available taker fee rate for `pair`.
    pub fn taker_rate(&self, pair: &str) -> f64 {
        self.symbol_rates
            .get(pair)
            .copied()
            .or(self.account_rate)
            .unwrap_or(self.default_rate)
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Order placement interface consumed by the Guard.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> Result<OrderFill, GatewayError>;

    /// Free balance of `asset` on the exchange.
    async fn account_balance(&self, asset: &str) -> Result<f64, GatewayError>;
}

// ---------------------------------------------------------------------------
// Signed REST gateway
// ---------------------------------------------------------------------------

/// REST gateway with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct RestGateway {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestGateway {
    /// Create a new gateway.
    ///
    /// * `api_key` — sent as a header on every request, never in the query.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (timestamp, recvWindow,
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Map an HTTP status + body into the transient/fatal taxonomy.
    fn classify_response(status: reqwest::StatusCode, body: &serde_json::Value) -> GatewayError {
        if status.is_server_error() || status.as_u16() == 429 {
            GatewayError::Transient(format!("exchange returned {status}: {body}"))
        } else {
            GatewayError::Fatal(format!("exchange returned {status}: {body}"))
        }
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl OrderGateway for RestGateway {
    #[instrument(skip(self, price), name = "gateway::place_order")]
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> Result<OrderFill, GatewayError> {
        let params = format!(
            "symbol={pair}&side={side}&type=LIMIT&quantity={amount}&price={price}&timeInForce={time_in_force}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(pair, %side, amount, price, %time_in_force, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("order request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("failed to parse order response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_response(status, &body));
        }

        let filled = Self::parse_str_f64(&body["executedQty"]);
        let quote_filled = Self::parse_str_f64(&body["cummulativeQuoteQty"]);
        let avg_price = if filled > 0.0 { quote_filled / filled } else { 0.0 };

        // Sum commissions across fills; the quote asset is assumed uniform.
        let mut fee = 0.0;
        let mut fee_asset = String::new();
        if let Some(fills) = body["fills"].as_array() {
            for f in fills {
                fee += Self::parse_str_f64(&f["commission"]);
                if fee_asset.is_empty() {
                    fee_asset = f["commissionAsset"].as_str().unwrap_or("").to_string();
                }
            }
        }

        let order_status = match body["status"].as_str() {
            Some("FILLED") => OrderStatus::Filled,
            Some("PARTIALLY_FILLED") => OrderStatus::PartiallyFilled,
            Some("EXPIRED") | Some("EXPIRED_IN_MATCH") => OrderStatus::Expired,
            other => {
                warn!(status = ?other, "unexpected order status — treating as rejected");
                OrderStatus::Rejected
            }
        };

        debug!(pair, filled, avg_price, fee, status = ?order_status, "order result");

        Ok(OrderFill {
            filled,
            avg_price,
            fee,
            fee_asset,
            status: order_status,
        })
    }

    #[instrument(skip(self), name = "gateway::account_balance")]
    async fn account_balance(&self, asset: &str) -> Result<f64, GatewayError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("account request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| {
            GatewayError::Transient(format!("failed to parse account response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::classify_response(status, &body));
        }

        let balances = body["balances"].as_array().cloned().unwrap_or_default();
        for b in &balances {
            if b["asset"].as_str() == Some(asset) {
                let free = Self::parse_str_f64(&b["free"]);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }
}

impl std::fmt::Debug for RestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGateway")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Simulated gateway (demo mode)
// ---------------------------------------------------------------------------

/// Local fill simulation: every order fills completely at its limit price,
/// charged at a flat taker rate. Balance is a fixed demo amount.
#[derive(Debug, Clone)]
pub struct SimGateway {
    pub taker_rate: f64,
    pub demo_balance: f64,
}

impl SimGateway {
    pub fn new(taker_rate: f64, demo_balance: f64) -> Self {
        Self {
            taker_rate,
            demo_balance,
        }
    }
}

#[async_trait]
impl OrderGateway for SimGateway {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        _time_in_force: TimeInForce,
    ) -> Result<OrderFill, GatewayError> {
        if amount <= 0.0 || price <= 0.0 {
            return Err(GatewayError::Fatal(format!(
                "invalid simulated order: amount={amount} price={price}"
            )));
        }
        debug!(pair, %side, amount, price, "simulated fill");
        Ok(OrderFill {
            filled: amount,
            avg_price: price,
            fee: amount * price * self.taker_rate,
            fee_asset: "USDT".to_string(),
            status: OrderStatus::Filled,
        })
    }

    async fn account_balance(&self, _asset: &str) -> Result<f64, GatewayError> {
        Ok(self.demo_balance)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_schedule_fallback_chain() {
        let mut schedule = FeeSchedule::flat(0.001);
        assert!((schedule.taker_rate("BTCUSDT") - 0.001).abs() < 1e-12);

        schedule.account_rate = Some(0.00075);
        assert!((schedule.taker_rate("BTCUSDT") - 0.00075).abs() < 1e-12);

        schedule.symbol_rates.insert("BTCUSDT".to_string(), 0.0005);
        assert!((schedule.taker_rate("BTCUSDT") - 0.0005).abs() < 1e-12);
        // Other symbols still use the account rate.
        assert!((schedule.taker_rate("ETHUSDT") - 0.00075).abs() < 1e-12);
    }

    #[test]
    fn error_classification() {
        assert!(GatewayError::Transient("503".into()).is_retryable());
        assert!(!GatewayError::Fatal("insufficient balance".into()).is_retryable());

        let e = RestGateway::classify_response(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            &serde_json::json!({}),
        );
        assert!(e.is_retryable());
        let e = RestGateway::classify_response(
            reqwest::StatusCode::BAD_REQUEST,
            &serde_json::json!({}),
        );
        assert!(!e.is_retryable());
        let e = RestGateway::classify_response(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            &serde_json::json!({}),
        );
        assert!(e.is_retryable());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let gw = RestGateway::new("key", "secret", "https://example.test");
        let sig1 = gw.sign("symbol=BTCUSDT&side=SELL");
        let sig2 = gw.sign("symbol=BTCUSDT&side=SELL");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn sim_gateway_fills_at_limit() {
        let gw = SimGateway::new(0.001, 10_000.0);
        let fill = gw
            .place_order("BTCUSDT", OrderSide::Sell, 0.01, 45_000.0, TimeInForce::Ioc)
            .await
            .unwrap();
        assert!(fill.is_filled());
        assert!((fill.avg_price - 45_000.0).abs() < 1e-9);
        assert!((fill.fee - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sim_gateway_rejects_invalid_orders() {
        let gw = SimGateway::new(0.001, 10_000.0);
        let err = gw
            .place_order("BTCUSDT", OrderSide::Sell, 0.0, 45_000.0, TimeInForce::Ioc)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn expired_ioc_is_not_filled() {
        let fill = OrderFill {
            filled: 0.0,
            avg_price: 0.0,
            fee: 0.0,
            fee_asset: String::new(),
            status: OrderStatus::Expired,
        };
        assert!(!fill.is_filled());
    }
}
