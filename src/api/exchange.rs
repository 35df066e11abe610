//! Exchange boundary used by the live adapter.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Bar, Side};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Side of the order that opens a position.
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that reduces a position.
    pub fn closing(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

/// Kind of resting protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

impl ProtectiveKind {
    /// Exchange order type.
    pub fn order_type(&self) -> &'static str {
        match self {
            ProtectiveKind::StopLoss => "STOP_MARKET",
            ProtectiveKind::TakeProfit => "TAKE_PROFIT_MARKET",
        }
    }
}

/// A position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute size, always > 0 for a reported position
    pub contracts: Decimal,
    pub entry_price: Decimal,
}

/// Acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    /// Average fill price when the exchange reports one
    pub avg_price: Option<Decimal>,
}

/// Market data and order routing for one futures account.
///
/// Every call may fail; callers treat failures as recoverable.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Recent bars, oldest first. `Ok(None)` means no data this cycle.
    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Option<Vec<Bar>>>;

    /// Free balance of `asset` available for margin.
    async fn free_balance(&self, asset: &str) -> Result<Decimal>;

    /// Open positions for `symbol` with non-zero size.
    async fn open_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck>;

    /// Resting order that closes the whole position when `trigger_price` trades.
    async fn protective_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ProtectiveKind,
        trigger_price: Decimal,
    ) -> Result<OrderAck>;

    async fn cancel_all(&self, symbol: &str) -> Result<()>;
}

/// `BTC/USDT`, `BTC/USDT:USDT` and `btcusdt` all map to `BTCUSDT`.
pub fn normalize_symbol(symbol: &str) -> String {
    let base = symbol.split(':').next().unwrap_or(symbol);
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}
