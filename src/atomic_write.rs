//! §4.6 atomic-write policy: a WRQ never writes the final name directly.
//! It writes `F.tmp`, then on success deletes any existing `F` and renames
//! `F.tmp` over it; on failure `F.tmp` is removed, leaving `F` untouched.

use std::path::{Path, PathBuf};

use tracing::warn;

pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    final_path.with_file_name(name)
}

/// Publish a successful WRQ: replace `final_path` with `temp_path`
/// atomically. Rename/delete failures are logged, not propagated — the
/// peer has already been told the transfer succeeded.
pub async fn publish(final_path: &Path, temp_path: &Path) {
    if tokio::fs::metadata(final_path).await.is_ok()
        && let Err(e) = tokio::fs::remove_file(final_path).await
    {
        warn!("failed to remove existing {}: {e}", final_path.display());
    }
    if let Err(e) = tokio::fs::rename(temp_path, final_path).await {
        warn!(
            "failed to rename {} to {}: {e}",
            temp_path.display(),
            final_path.display()
        );
    }
}

/// Discard a failed WRQ's temp file, leaving any existing `final_path`
/// intact.
pub async fn discard(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("failed to remove temp file {}: {e}", temp_path.display());
    }
}
