//! Out-of-band control surfaces: a single-slot command file per account and a
//! status snapshot published once per cycle.

mod command;
mod status;

pub use command::{Command, CommandSlot};
pub use status::{StatusBoard, StatusSnapshot};

use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` via a sibling temp file and rename, so readers
/// never observe a partial file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}
