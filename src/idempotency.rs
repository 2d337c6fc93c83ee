//! At-most-one active pipeline per branch, persisted to `.branchline/active-pipelines.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};

use crate::fsutil::write_json_atomic;

pub struct CheckResult {
    pub is_duplicate: bool,
    pub existing_request_id: Option<String>,
}

/// Branch names can contain slashes, unicode, or anything else a human
/// types into a ref name; hashing them down to a fixed hex key keeps the
/// persisted map and the in-memory map keyed identically regardless of
/// what characters the branch name carries.
fn branch_key(branch: &str) -> String {
    let digest = Sha256::digest(branch.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// `sha256(branch) -> request_id`, backed by a lock-free concurrent map
/// with a single debounced background flush task, the way `merge_state.rs`'s
/// atomic write is reused across the crate but kept off the registration
/// hot path.
pub struct IdempotencyGuard {
    active: DashMap<String, String>,
    persist_path: PathBuf,
    dirty: Notify,
    flush_lock: Mutex<()>,
}

impl IdempotencyGuard {
    pub fn new(persist_path: PathBuf) -> Arc<Self> {
        let guard = Arc::new(Self {
            active: DashMap::new(),
            persist_path,
            dirty: Notify::new(),
            flush_lock: Mutex::new(()),
        });
        guard.clone().spawn_flusher();
        guard
    }

    /// Rehydrate from disk. Absence of the file is a no-op.
    pub async fn load_from_disk(&self) -> anyhow::Result<()> {
        if !self.persist_path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&self.persist_path).await?;
        let map: HashMap<String, String> = serde_json::from_str(&raw)?;
        for (branch, request_id) in map {
            self.active.insert(branch, request_id);
        }
        Ok(())
    }

    pub fn check(&self, branch: &str) -> CheckResult {
        match self.active.get(&branch_key(branch)) {
            Some(entry) => CheckResult { is_duplicate: true, existing_request_id: Some(entry.clone()) },
            None => CheckResult { is_duplicate: false, existing_request_id: None },
        }
    }

    /// Upsert, synchronously from the caller's perspective; schedules a
    /// debounced flush to disk.
    pub fn register(&self, branch: impl AsRef<str>, request_id: impl Into<String>) {
        self.active.insert(branch_key(branch.as_ref()), request_id.into());
        self.dirty.notify_one();
    }

    pub fn release(&self, branch: &str) {
        self.active.remove(&branch_key(branch));
        self.dirty.notify_one();
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.active.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.flush_lock.lock().await;
        write_json_atomic(&self.persist_path, &self.snapshot()).await
    }

    /// Debounced background flush: waits for a dirty signal, then a short
    /// settle window to coalesce bursts of register/release calls before
    /// writing once.
    fn spawn_flusher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.dirty.notified().await;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                if let Err(e) = self.flush().await {
                    tracing::error!(error = %e, "failed to flush active-pipelines file");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_key_is_deterministic_and_distinguishes_branches() {
        assert_eq!(branch_key("feature/x"), branch_key("feature/x"));
        assert_ne!(branch_key("feature/x"), branch_key("feature/y"));
        assert_eq!(branch_key("feature/x").len(), 64);
    }

    #[tokio::test]
    async fn register_then_check_reports_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let guard = IdempotencyGuard::new(dir.path().join("active-pipelines.json"));
        guard.register("feature/x", "r1");
        let result = guard.check("feature/x");
        assert!(result.is_duplicate);
        assert_eq!(result.existing_request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn register_release_check_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let guard = IdempotencyGuard::new(dir.path().join("active-pipelines.json"));
        guard.register("feature/x", "r1");
        guard.release("feature/x");
        assert!(!guard.check("feature/x").is_duplicate);
    }

    #[tokio::test]
    async fn flush_persists_and_reload_rehydrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active-pipelines.json");
        let guard = IdempotencyGuard::new(path.clone());
        guard.register("feature/x", "r1");
        guard.flush().await.unwrap();

        let reloaded = IdempotencyGuard::new(path);
        reloaded.load_from_disk().await.unwrap();
        assert!(reloaded.check("feature/x").is_duplicate);
    }

    #[tokio::test]
    async fn missing_persist_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let guard = IdempotencyGuard::new(dir.path().join("does-not-exist.json"));
        guard.load_from_disk().await.unwrap();
        assert!(!guard.check("anything").is_duplicate);
    }
}
