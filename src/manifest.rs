//! ManifestManager: atomic read/modify/write of the branch-lifecycle manifest.
//!
//! Generalizes `merge_state.rs`'s atomic-write idiom (temp file + `sync_all`
//! + rename) applied to the `Manifest` record, serialised by one exclusive
//! lock around the whole read-modify-write, matching `factory/db.rs`'s CRUD
//! naming for the operation set.

use std::path::{Path, PathBuf};

use branchline_common::manifest::{HistoryEntry, Manifest, PendingMergeEntry, ReadyEntry};
use fs2::FileExt;
use tokio::sync::Mutex;

use crate::fsutil::write_json_atomic;

pub struct MovedToPendingMerge {
    pub pr_number: u64,
    pub pr_url: String,
    pub integration_branch: String,
    pub base_main_sha: String,
}

/// Cross-process exclusive lock on a `.lock` sibling of the manifest path,
/// complementing the in-process `tokio::sync::Mutex` below: two `branchline`
/// processes (a `run` and a `director` sharing one project dir) can't
/// interleave writes to the same `manifest.json`.
struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct ManifestManager {
    path: PathBuf,
    manifest: Mutex<Manifest>,
}

impl ManifestManager {
    /// Read the manifest file if present, otherwise start from the empty
    /// default manifest (per §6's documented missing-file shape).
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let manifest = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&raw)?
        } else {
            Manifest::default()
        };
        Ok(Self { path, manifest: Mutex::new(manifest) })
    }

    async fn persist(&self, manifest: &mut Manifest) -> anyhow::Result<()> {
        manifest.last_updated = chrono::Utc::now().to_rfc3339();
        let lock_path = self.path.clone();
        let _lock = tokio::task::spawn_blocking(move || FileLock::acquire(&lock_path)).await??;
        write_json_atomic(&self.path, manifest).await
    }

    /// Idempotent on `branch`: a second add for an existing branch preserves
    /// the first entry's `request_id` and otherwise leaves it untouched.
    pub async fn add_to_ready(&self, entry: ReadyEntry) -> anyhow::Result<()> {
        let mut manifest = self.manifest.lock().await;
        if !manifest.ready.iter().any(|e| e.branch == entry.branch) {
            manifest.ready.push(entry);
            self.persist(&mut manifest).await?;
        }
        Ok(())
    }

    pub async fn find_ready(&self, branch: &str) -> Option<ReadyEntry> {
        let manifest = self.manifest.lock().await;
        manifest.ready.iter().find(|e| e.branch == branch).cloned()
    }

    pub async fn remove_from_ready(&self, branch: &str) -> anyhow::Result<Option<ReadyEntry>> {
        let mut manifest = self.manifest.lock().await;
        let position = manifest.ready.iter().position(|e| e.branch == branch);
        let removed = position.map(|i| manifest.ready.remove(i));
        if removed.is_some() {
            self.persist(&mut manifest).await?;
        }
        Ok(removed)
    }

    /// Precondition: `branch` is in `ready`. No-op (returns `None`) otherwise.
    pub async fn move_to_pending_merge(
        &self,
        branch: &str,
        outputs: MovedToPendingMerge,
    ) -> anyhow::Result<Option<PendingMergeEntry>> {
        let mut manifest = self.manifest.lock().await;
        let position = manifest.ready.iter().position(|e| e.branch == branch);
        let Some(position) = position else { return Ok(None) };
        let mut ready = manifest.ready.remove(position);
        ready.base_main_sha = outputs.base_main_sha;
        let pending = PendingMergeEntry {
            ready,
            pr_number: outputs.pr_number,
            pr_url: outputs.pr_url,
            integration_branch: outputs.integration_branch,
        };
        manifest.pending_merge.push(pending.clone());
        self.persist(&mut manifest).await?;
        Ok(Some(pending))
    }

    /// Rollback: move a pending-merge entry back to `ready`.
    pub async fn move_back_to_ready(&self, branch: &str) -> anyhow::Result<Option<ReadyEntry>> {
        let mut manifest = self.manifest.lock().await;
        let position = manifest.pending_merge.iter().position(|e| e.ready.branch == branch);
        let Some(position) = position else { return Ok(None) };
        let pending = manifest.pending_merge.remove(position);
        let ready = pending.ready;
        manifest.ready.push(ready.clone());
        self.persist(&mut manifest).await?;
        Ok(Some(ready))
    }

    pub async fn update_pending_merge_base_sha(
        &self,
        branch: &str,
        sha: &str,
    ) -> anyhow::Result<bool> {
        let mut manifest = self.manifest.lock().await;
        let entry = manifest.pending_merge.iter_mut().find(|e| e.ready.branch == branch);
        let Some(entry) = entry else { return Ok(false) };
        entry.ready.base_main_sha = sha.to_string();
        self.persist(&mut manifest).await?;
        Ok(true)
    }

    /// `commit_sha` is always required — callers (the `integration.pr.merged`
    /// webhook handler) always have it from the payload.
    pub async fn move_to_merge_history(
        &self,
        branch: &str,
        commit_sha: &str,
    ) -> anyhow::Result<Option<HistoryEntry>> {
        let mut manifest = self.manifest.lock().await;
        let position = manifest.pending_merge.iter().position(|e| e.ready.branch == branch);
        let Some(position) = position else { return Ok(None) };
        let pending = manifest.pending_merge.remove(position);
        let history = HistoryEntry {
            pending,
            commit_sha: commit_sha.to_string(),
            merged_at: chrono::Utc::now(),
        };
        manifest.merge_history.push(history.clone());
        self.persist(&mut manifest).await?;
        Ok(Some(history))
    }

    pub async fn get_main_head(&self) -> String {
        self.manifest.lock().await.main_head.clone()
    }

    pub async fn update_main_head(&self, sha: &str) -> anyhow::Result<()> {
        let mut manifest = self.manifest.lock().await;
        manifest.main_head = sha.to_string();
        self.persist(&mut manifest).await
    }

    pub async fn pending_merge_snapshot(&self) -> Vec<PendingMergeEntry> {
        self.manifest.lock().await.pending_merge.clone()
    }

    pub async fn ready_snapshot(&self) -> Vec<ReadyEntry> {
        self.manifest.lock().await.ready.clone()
    }

    pub async fn merge_history_snapshot(&self) -> Vec<HistoryEntry> {
        self.manifest.lock().await.merge_history.clone()
    }
}
