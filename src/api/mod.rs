//! Exchange API: the `Exchange` boundary and the Binance futures client.

mod binance_client;
mod exchange;

pub use binance_client::{BinanceClient, FAPI_URL};
pub use exchange::{
    normalize_symbol, Exchange, ExchangePosition, OrderAck, OrderSide, ProtectiveKind,
};
