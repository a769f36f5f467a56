//! Atomic file replacement
//!
//! All persisted state (config document, certificate pair, repository files,
//! PID marker) is written to a sibling temp file, flushed, and renamed over the
//! live path. Readers see either the old file or the new one, never a mix.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Build a unique temp path next to `path` (same directory, same filesystem)
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

/// Write `data` to a new file at `path` and flush it to disk
///
/// Fails if `path` already exists.
pub async fn write_synced(path: &Path, data: &[u8], mode: Option<u32>) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Replace `path` with `data` via temp file + rename
pub async fn replace_file(path: &Path, data: &[u8], mode: Option<u32>) -> io::Result<()> {
    let temp = temp_sibling(path);

    if let Err(e) = write_synced(&temp, data, mode).await {
        tokio::fs::remove_file(&temp).await.ok();
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&temp, path).await {
        tokio::fs::remove_file(&temp).await.ok();
        return Err(e);
    }

    Ok(())
}
