//! Binance USD-M futures REST client.
//!
//! Handles:
//! - Klines for the signal window (retried with backoff)
//! - Balance and position queries
//! - Market, STOP_MARKET and TAKE_PROFIT_MARKET orders
//! - HMAC-SHA256 request signing

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::models::{Bar, Side};

use super::exchange::{
    normalize_symbol, Exchange, ExchangePosition, OrderAck, OrderSide, ProtectiveKind,
};

pub const FAPI_URL: &str = "https://fapi.binance.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceEntry {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    #[serde(default)]
    avg_price: Option<String>,
}

/// Signed client for one futures account.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// Decimal places for trigger prices (None = send as computed)
    price_precision: Option<u32>,
}

impl BinanceClient {
    /// Create a new client.
    pub fn new(api_key: &str, api_secret: &str, base_url: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.unwrap_or(FAPI_URL).trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            price_precision: None,
        })
    }

    /// Create from the environment variables named by an account's config.
    pub fn from_env(key_var: &str, secret_var: &str, base_url: Option<&str>) -> Result<Self> {
        let api_key = std::env::var(key_var).with_context(|| format!("{} not set", key_var))?;
        let api_secret =
            std::env::var(secret_var).with_context(|| format!("{} not set", secret_var))?;
        Self::new(&api_key, &api_secret, base_url)
    }

    /// Unsigned client for public market data (backtest downloads).
    pub fn public(base_url: Option<&str>) -> Result<Self> {
        Self::new("", "", base_url)
    }

    pub fn with_price_precision(mut self, precision: Option<u32>) -> Self {
        self.price_precision = precision;
        self
    }

    /// Hex HMAC-SHA256 of the query string.
    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow!("Invalid API secret: {}", e))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        ));
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    /// Send a signed request and return the raw response body.
    async fn signed(&self, method: Method, path: &str, params: &[(&str, String)]) -> Result<String> {
        if self.api_key.is_empty() {
            bail!("API credentials not configured");
        }
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);

        debug!(method = %method, path = %path, "Signed request");

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("{} failed: {} - {}", path, status, body);
        }
        Ok(body)
    }

    fn format_price(&self, price: Decimal) -> String {
        match self.price_precision {
            Some(dp) => price.round_dp(dp).normalize().to_string(),
            None => price.normalize().to_string(),
        }
    }
}

fn parse_decimal(value: &Value) -> Result<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).with_context(|| format!("Invalid decimal: {}", s)),
        Value::Number(n) => Decimal::from_str(&n.to_string()).context("Invalid decimal"),
        other => Err(anyhow!("Expected decimal, got {}", other)),
    }
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, ...]`.
fn parse_kline(row: &Value) -> Result<Bar> {
    let fields = row.as_array().ok_or_else(|| anyhow!("Kline is not an array"))?;
    if fields.len() < 6 {
        bail!("Kline has {} fields", fields.len());
    }
    let open_time = fields[0]
        .as_i64()
        .ok_or_else(|| anyhow!("Kline open time is not an integer"))?;
    let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(open_time)
        .ok_or_else(|| anyhow!("Kline open time out of range"))?;

    Ok(Bar::new(
        timestamp,
        parse_decimal(&fields[1])?,
        parse_decimal(&fields[2])?,
        parse_decimal(&fields[3])?,
        parse_decimal(&fields[4])?,
        parse_decimal(&fields[5])?,
    ))
}

fn parse_order(body: &str) -> Result<OrderAck> {
    let resp: OrderResponse = serde_json::from_str(body).context("Failed to parse order response")?;
    let avg_price = resp
        .avg_price
        .and_then(|p| Decimal::from_str(&p).ok())
        .filter(|p| !p.is_zero());
    Ok(OrderAck {
        order_id: resp.order_id.to_string(),
        status: resp.status,
        avg_price,
    })
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Option<Vec<Bar>>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            normalize_symbol(symbol),
            interval,
            limit.min(1500)
        );

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let url = url.as_str();
        let rows: Vec<Value> = retry(policy, || async move {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(backoff::Error::transient)?;
            let resp = resp.error_for_status().map_err(backoff::Error::transient)?;
            resp.json().await.map_err(backoff::Error::permanent)
        })
        .await
        .context("Failed to fetch klines")?;

        if rows.is_empty() {
            return Ok(None);
        }

        let bars = rows.iter().map(parse_kline).collect::<Result<Vec<_>>>()?;
        Ok(Some(bars))
    }

    async fn free_balance(&self, asset: &str) -> Result<Decimal> {
        let body = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;
        let entries: Vec<BalanceEntry> =
            serde_json::from_str(&body).context("Failed to parse balance response")?;

        Ok(entries
            .into_iter()
            .find(|e| e.asset.eq_ignore_ascii_case(asset))
            .map(|e| e.available_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn open_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[("symbol", symbol.clone())])
            .await?;
        let risks: Vec<PositionRisk> =
            serde_json::from_str(&body).context("Failed to parse position response")?;

        Ok(risks
            .into_iter()
            .filter(|r| r.symbol == symbol && !r.position_amt.is_zero())
            .map(|r| ExchangePosition {
                symbol: r.symbol,
                side: if r.position_amt > Decimal::ZERO { Side::Long } else { Side::Short },
                contracts: r.position_amt.abs(),
                entry_price: r.entry_price,
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.signed(
            Method::POST,
            "/fapi/v1/leverage",
            &[("symbol", normalize_symbol(symbol)), ("leverage", leverage.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", normalize_symbol(symbol)),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", uuid::Uuid::new_v4().simple().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        parse_order(&body)
    }

    async fn protective_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ProtectiveKind,
        trigger_price: Decimal,
    ) -> Result<OrderAck> {
        let params = [
            ("symbol", normalize_symbol(symbol)),
            ("side", side.as_str().to_string()),
            ("type", kind.order_type().to_string()),
            ("stopPrice", self.format_price(trigger_price)),
            ("closePosition", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        parse_order(&body)
    }

    async fn cancel_all(&self, symbol: &str) -> Result<()> {
        self.signed(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &[("symbol", normalize_symbol(symbol))],
        )
        .await?;
        Ok(())
    }
}
