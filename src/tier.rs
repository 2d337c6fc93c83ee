//! Change-statistics based tier classification.
//!
//! Generalizes `tracker/git.rs::GitTracker::compute_changes` (there: diff a
//! snapshot commit against the workdir) into "diff a worktree's current
//! contents against its base branch tip", the input `branchline_common::tier`
//! classifies against configured thresholds.

use std::path::Path;

use branchline_common::{ChangeStats, Tier, TierThresholds};
use git2::{DiffOptions, Repository};

use crate::config::TiersConfig;

/// Compute file/line change statistics for `worktree_path` relative to
/// `base_branch`'s tip. Untracked files count toward the diff, matching
/// `tracker/git.rs`'s `include_untracked` setting.
pub fn compute_change_stats(worktree_path: &Path, base_branch: &str) -> anyhow::Result<ChangeStats> {
    let repo = Repository::open(worktree_path)?;
    let base_ref = repo
        .resolve_reference_from_short_name(base_branch)
        .or_else(|_| repo.find_reference(&format!("refs/remotes/origin/{base_branch}")))?;
    let base_commit = base_ref.peel_to_commit()?;
    let base_tree = base_commit.tree()?;

    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);

    let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;
    let stats = diff.stats()?;

    Ok(ChangeStats {
        files_changed: stats.files_changed() as u64,
        lines_changed: (stats.insertions() + stats.deletions()) as u64,
    })
}

/// Build `TierThresholds` from the configuration's three tier bands.
pub fn thresholds_from_config(config: &TiersConfig) -> TierThresholds {
    TierThresholds {
        small_max_files: config.small.max_files.map(u64::from).unwrap_or(u64::MAX),
        small_max_lines: config.small.max_lines.map(u64::from).unwrap_or(u64::MAX),
        medium_max_files: config.medium.max_files.map(u64::from).unwrap_or(u64::MAX),
        medium_max_lines: config.medium.max_lines.map(u64::from).unwrap_or(u64::MAX),
    }
}

/// Classify a request's change, honoring an explicit tier override.
pub fn classify(stats: ChangeStats, thresholds: &TierThresholds, override_tier: Option<Tier>) -> Tier {
    override_tier.unwrap_or_else(|| thresholds.classify(stats))
}

/// The agent roster configured for a tier.
pub fn agents_for_tier<'a>(config: &'a TiersConfig, tier: Tier) -> &'a [String] {
    match tier {
        Tier::Small => &config.small.agents,
        Tier::Medium => &config.medium.agents,
        Tier::Large => &config.large.agents,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        repo.branch("main", &repo.head().unwrap().peel_to_commit().unwrap(), true).unwrap();
        repo
    }

    #[test]
    fn reports_zero_change_against_identical_head() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let stats = compute_change_stats(dir.path(), "main").unwrap();
        assert_eq!(stats.files_changed, 0);
        assert_eq!(stats.lines_changed, 0);
    }

    #[test]
    fn detects_modified_and_new_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new file\n").unwrap();

        let stats = compute_change_stats(dir.path(), "main").unwrap();
        assert_eq!(stats.files_changed, 2);
        assert!(stats.lines_changed >= 2);
    }

    #[test]
    fn tier_threshold_boundary_classifies_lower_tier() {
        let thresholds = TierThresholds::default();
        let stats = ChangeStats { files_changed: 3, lines_changed: 100 };
        assert_eq!(classify(stats, &thresholds, None), Tier::Small);
    }

    #[test]
    fn explicit_override_wins_over_computed_stats() {
        let thresholds = TierThresholds::default();
        let stats = ChangeStats { files_changed: 1000, lines_changed: 1000 };
        assert_eq!(classify(stats, &thresholds, Some(Tier::Small)), Tier::Small);
    }
}
