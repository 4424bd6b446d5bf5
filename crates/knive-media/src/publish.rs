//! Putting files in place for clients.
//!
//! Readers may fetch a playlist at any moment, so documents are written to
//! a hidden sibling and renamed over the target.

use std::path::{Path, PathBuf};

use knive_core::backoff::{retry_transient, Backoff};
use knive_core::{Error, Result};

const MOVE_ATTEMPTS: usize = 5;

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("not a file path: {}", path.display())))?;
    Ok(path.with_file_name(format!(".{}.tmp", name.to_string_lossy())))
}

/// Replace `path` with `contents` in one rename.
pub async fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let tmp = temp_sibling(path)?;
    tokio::fs::write(&tmp, contents.as_ref()).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Move `from` to `to`, retrying transient failures. When a rename is
/// impossible (different filesystems) the file is copied and the source
/// removed.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    let renamed = retry_transient(MOVE_ATTEMPTS, Backoff::io_retry(), || async move {
        tokio::fs::rename(from, to).await.map_err(Error::from)
    })
    .await;

    match renamed {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !tokio::fs::try_exists(from).await.unwrap_or(false) {
                return Err(rename_err);
            }
            tracing::debug!(
                "Rename {} -> {} failed ({}); copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            copy_file(from, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(())
        }
    }
}

/// Copy `from` to `to` through a temporary sibling so `to` never appears
/// half-written.
pub async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    let tmp = temp_sibling(to)?;
    let staged = tmp.as_path();
    retry_transient(MOVE_ATTEMPTS, Backoff::io_retry(), || async move {
        tokio::fs::copy(from, staged).await.map_err(Error::from)
    })
    .await?;
    if let Err(e) = tokio::fs::rename(&tmp, to).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
