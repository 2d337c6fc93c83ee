//! `branchline manifest show` — print the current manifest (ready,
//! pending-merge, and merge-history lists) as pretty-printed JSON, the way
//! `cmd/project.rs::cmd_project_status` prints a status summary.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::Config;
use crate::manifest::ManifestManager;

pub async fn cmd_manifest_show(project_dir: PathBuf, config: Config) -> Result<()> {
    let manager = ManifestManager::load(config.manifest_path(&project_dir)).await?;

    let body = serde_json::json!({
        "ready": manager.ready_snapshot().await,
        "pending_merge": manager.pending_merge_snapshot().await,
        "merge_history": manager.merge_history_snapshot().await,
        "main_head": manager.get_main_head().await,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
