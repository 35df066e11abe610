//! Trade log persistence.
//!
//! Append-only: trades are inserted once when they close and never updated.
//! Prices and amounts are stored as decimal text so they read back exactly.

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::Trade;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Trade row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub account: String,
    pub symbol: String,
    pub side: String,
    pub entry_time: String,
    pub exit_time: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub realized_pnl: String,
    pub pnl_percent: String,
    pub fees: String,
    pub exit_reason: String,
}

impl StoredTrade {
    pub fn pnl(&self) -> Decimal {
        Decimal::from_str(&self.realized_pnl).unwrap_or(Decimal::ZERO)
    }
}

/// One step of the cumulative P&L series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnlPoint {
    pub exit_time: String,
    pub pnl: Decimal,
    pub cumulative: Decimal,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        if let Some(path) = database_url
            .strip_prefix("sqlite:")
            .map(|p| p.split('?').next().unwrap_or(p))
            .filter(|p| !p.is_empty() && !p.starts_with(':'))
        {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {:?}", parent))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        // One connection, or every pooled connection gets its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                pnl_percent TEXT NOT NULL,
                fees TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                logged_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_account_symbol ON trades(account, symbol, exit_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a closed trade. Returns its row id.
    pub async fn log_trade(&self, account: &str, symbol: &str, trade: &Trade) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (account, symbol, side, entry_time, exit_time, entry_price,
                exit_price, quantity, realized_pnl, pnl_percent, fees, exit_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account)
        .bind(symbol)
        .bind(trade.side().as_str())
        .bind(trade.entry_time().to_rfc3339())
        .bind(trade.exit_time().to_rfc3339())
        .bind(trade.entry_price().to_string())
        .bind(trade.exit_price().to_string())
        .bind(trade.quantity().to_string())
        .bind(trade.realized_pnl().to_string())
        .bind(trade.pnl_percent().to_string())
        .bind(trade.fees().to_string())
        .bind(trade.exit_reason().as_str())
        .execute(&self.pool)
        .await
        .context("Failed to log trade")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent trades first, optionally filtered by account and symbol.
    pub async fn recent_trades(
        &self,
        account: Option<&str>,
        symbol: Option<&str>,
        limit: u32,
    ) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, account, symbol, side, entry_time, exit_time, entry_price, exit_price,
                quantity, realized_pnl, pnl_percent, fees, exit_reason
            FROM trades
            WHERE (? IS NULL OR account = ?) AND (? IS NULL OR symbol = ?)
            ORDER BY exit_time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(account)
        .bind(account)
        .bind(symbol)
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query trades")
    }

    /// Running P&L per trade, oldest first.
    pub async fn cumulative_pnl(&self, account: &str, symbol: &str) -> Result<Vec<PnlPoint>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT exit_time, realized_pnl FROM trades
            WHERE account = ? AND symbol = ?
            ORDER BY exit_time ASC, id ASC
            "#,
        )
        .bind(account)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query P&L series")?;

        let mut cumulative = Decimal::ZERO;
        rows.into_iter()
            .map(|(exit_time, pnl)| {
                let pnl = Decimal::from_str(&pnl)
                    .with_context(|| format!("Corrupt P&L value: {}", pnl))?;
                cumulative += pnl;
                Ok(PnlPoint {
                    exit_time,
                    pnl,
                    cumulative,
                })
            })
            .collect()
    }

    /// Distinct (account, symbol) pairs with logged trades.
    pub async fn series_keys(&self) -> Result<Vec<(String, String)>> {
        sqlx::query_as("SELECT DISTINCT account, symbol FROM trades ORDER BY account, symbol")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list trade series")
    }
}
