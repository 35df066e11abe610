//! Single-slot command channel. At most one command is pending per account;
//! reading it removes it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::write_atomic;

/// Operator command consumed by a live loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Cancel resting orders and flatten the tracked position
    CloseAll,
    /// Stop evaluating signals until resumed
    Pause,
    Resume,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "close_all" | "closeall" => Ok(Command::CloseAll),
            "pause" => Ok(Command::Pause),
            "resume" => Ok(Command::Resume),
            _ => Err(anyhow!("Unknown command '{}' (expected close-all, pause or resume)", s)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    command: Command,
    issued_at: DateTime<Utc>,
}

/// The command file of one account.
#[derive(Debug, Clone)]
pub struct CommandSlot {
    path: PathBuf,
}

impl CommandSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<account>.json`
    pub fn for_account(dir: &Path, account: &str) -> Self {
        Self::new(dir.join(format!("{}.json", account)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a command. Returns false, leaving the slot untouched, if another
    /// command is still pending.
    ///
    /// The envelope is written to a private temp file and hard-linked into
    /// place, which fails if the slot exists. Concurrent posters cannot both
    /// win, and a reader never sees a partial file.
    pub async fn post(&self, command: Command) -> Result<bool> {
        let envelope = Envelope {
            command,
            issued_at: Utc::now(),
        };
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        write_atomic(&tmp, &serde_json::to_vec_pretty(&envelope)?).await?;

        let linked = tokio::fs::hard_link(&tmp, &self.path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(path = ?tmp, error = %e, "Failed to remove temp command file");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to post {:?}", self.path)),
        }
    }

    /// Read and remove the pending command, if any.
    ///
    /// A malformed file is removed too, so it cannot block the slot.
    pub async fn take(&self) -> Result<Option<Command>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        };
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove {:?}", self.path))?;

        let envelope: Envelope =
            serde_json::from_slice(&raw).context("Malformed command file discarded")?;
        Ok(Some(envelope.command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_consumes_command() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CommandSlot::for_account(dir.path(), "main");

        assert_eq!(slot.take().await.unwrap(), None);
        assert!(slot.post(Command::CloseAll).await.unwrap());
        assert_eq!(slot.take().await.unwrap(), Some(Command::CloseAll));
        assert_eq!(slot.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_slot_rejects_second_post() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CommandSlot::for_account(dir.path(), "main");

        assert!(slot.post(Command::Pause).await.unwrap());
        assert!(!slot.post(Command::CloseAll).await.unwrap());
        assert_eq!(slot.take().await.unwrap(), Some(Command::Pause));
    }

    #[tokio::test]
    async fn test_malformed_command_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CommandSlot::for_account(dir.path(), "main");
        tokio::fs::write(slot.path(), b"{not json").await.unwrap();

        assert!(slot.take().await.is_err());
        assert!(!slot.path().exists());
    }

    #[tokio::test]
    async fn test_concurrent_posts_fill_slot_once() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CommandSlot::for_account(dir.path(), "main");

        let (a, b, c) = tokio::join!(
            slot.post(Command::Pause),
            slot.post(Command::CloseAll),
            slot.post(Command::Resume),
        );
        let accepted = [a.unwrap(), b.unwrap(), c.unwrap()];
        assert_eq!(accepted.iter().filter(|&&ok| ok).count(), 1);

        let winner = [Command::Pause, Command::CloseAll, Command::Resume]
            [accepted.iter().position(|&ok| ok).unwrap()];
        assert_eq!(slot.take().await.unwrap(), Some(winner));

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[test]
    fn test_command_names() {
        assert_eq!("close-all".parse::<Command>().unwrap(), Command::CloseAll);
        assert_eq!("PAUSE".parse::<Command>().unwrap(), Command::Pause);
        assert!("liquidate".parse::<Command>().is_err());
    }
}
