//! The durable record of branch flow: `ready -> pending_merge -> merge_history`.

use serde::{Deserialize, Serialize};

use crate::tier::Tier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyEntry {
    pub branch: String,
    pub pipeline_branch: String,
    pub worktree_path: String,
    pub request_id: String,
    pub tier: Tier,
    pub pipeline_result: serde_json::Value,
    #[serde(default)]
    pub corrections_applied: Vec<String>,
    pub ready_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub base_main_sha: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMergeEntry {
    #[serde(flatten)]
    pub ready: ReadyEntry,
    pub pr_number: u64,
    pub pr_url: String,
    pub integration_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub pending: PendingMergeEntry,
    pub commit_sha: String,
    pub merged_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub main_branch: String,
    pub main_head: String,
    #[serde(default)]
    pub ready: Vec<ReadyEntry>,
    #[serde(default)]
    pub pending_merge: Vec<PendingMergeEntry>,
    #[serde(default)]
    pub merge_history: Vec<HistoryEntry>,
    pub last_updated: String,
}

impl Default for Manifest {
    /// The empty manifest a missing manifest file reads as.
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            main_head: String::new(),
            ready: Vec::new(),
            pending_merge: Vec::new(),
            merge_history: Vec::new(),
            last_updated: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_manifest_matches_empty_shape() {
        let manifest = Manifest::default();
        assert_eq!(manifest.main_branch, "main");
        assert_eq!(manifest.main_head, "");
        assert!(manifest.ready.is_empty());
        assert!(manifest.pending_merge.is_empty());
        assert!(manifest.merge_history.is_empty());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest::default();
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.main_branch, manifest.main_branch);
    }
}
