//! Per-account status snapshot, rewritten once per live cycle.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Direction, PositionStatus};

use super::write_atomic;

/// What an observer can learn about a live loop without talking to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub account: String,
    pub symbol: String,
    pub updated_at: DateTime<Utc>,
    pub running: bool,
    pub position: PositionStatus,
    pub price: Option<Decimal>,
    pub signal: Option<Direction>,
    pub rationale: Option<String>,
    /// Trend strength on the confirmation bar
    pub indicator: Option<Decimal>,
    pub balance: Option<Decimal>,
    /// Last cycle failure, cleared by the next successful cycle
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn new(account: &str, symbol: &str) -> Self {
        Self {
            account: account.to_string(),
            symbol: symbol.to_string(),
            updated_at: Utc::now(),
            running: true,
            position: PositionStatus::Idle,
            price: None,
            signal: None,
            rationale: None,
            indicator: None,
            balance: None,
            error: None,
        }
    }
}

/// Directory of status files, one per account.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    dir: PathBuf,
}

impl StatusBoard {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, account: &str) -> PathBuf {
        self.dir.join(format!("{}.json", account))
    }

    pub async fn publish(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path(&snapshot.account), &body).await
    }

    pub async fn read(&self, account: &str) -> Result<Option<StatusSnapshot>> {
        read_snapshot(&self.path(account)).await
    }

    /// All published snapshots, by account name.
    pub async fn read_all(&self) -> Result<Vec<StatusSnapshot>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", self.dir)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(snapshot) = read_snapshot(&path).await? {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(snapshots)
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<StatusSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .with_context(|| format!("Failed to parse {:?}", path)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
    }
}
