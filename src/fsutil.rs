//! Atomic JSON file writes: temp file in the same directory, `sync_all`, rename.
//!
//! Shared by the ManifestManager, IdempotencyGuard, and DeadLetterQueue —
//! every durable record this crate owns goes through this helper so none of
//! them can observe a half-written file.

use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write")
    ));

    let json = serde_json::to_vec_pretty(value)?;
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
