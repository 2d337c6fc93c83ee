//! BranchCleaner: post-completion / post-merge branch deletion with policy.
//!
//! Grounded on `factory/agent_executor.rs::cleanup_worktree` (`git worktree
//! remove --force`) and `tracker/git.rs`'s repository-handle conventions.

use std::path::{Path, PathBuf};

use tokio::process::Command;

pub struct BranchCleaner {
    repo_path: PathBuf,
    keep_on_failure: bool,
}

impl BranchCleaner {
    pub fn new(repo_path: PathBuf, keep_on_failure: bool) -> Self {
        Self { repo_path, keep_on_failure }
    }

    async fn run_git(&self, args: &[&str]) -> anyhow::Result<()> {
        let output = Command::new("git").args(args).current_dir(&self.repo_path).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(args = ?args, stderr = %stderr, "git cleanup command failed");
        }
        Ok(())
    }

    /// `git worktree remove --force <path>`. Tolerates an already-removed
    /// worktree.
    pub async fn remove_worktree(&self, worktree_path: &Path) -> anyhow::Result<()> {
        let path = worktree_path.to_string_lossy().to_string();
        self.run_git(&["worktree", "remove", "--force", &path]).await
    }

    /// `git branch -D <branch>`, local only.
    pub async fn delete_local_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.run_git(&["branch", "-D", branch]).await
    }

    /// `git push origin --delete <branch>`.
    pub async fn delete_remote_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.run_git(&["push", "origin", "--delete", branch]).await
    }

    /// Unconditional delete of a pipeline branch after a completed pipeline.
    pub async fn delete_pipeline_branch(&self, worktree_path: Option<&Path>, branch: &str) -> anyhow::Result<()> {
        if let Some(path) = worktree_path {
            self.remove_worktree(path).await?;
        }
        self.delete_local_branch(branch).await
    }

    /// §4.9: `pipeline.failed` deletes the pipeline branch unless policy
    /// says to keep it for operator inspection.
    pub async fn conditional_delete_on_failure(
        &self,
        worktree_path: Option<&Path>,
        branch: &str,
    ) -> anyhow::Result<()> {
        if self.keep_on_failure {
            tracing::info!(branch, "keeping failed pipeline branch per cleanup policy");
            return Ok(());
        }
        self.delete_pipeline_branch(worktree_path, branch).await
    }

    /// §4.9: after `integration.pr.merged`, delete both the pipeline and the
    /// integration branch, locally and on the remote.
    pub async fn cleanup_after_merge(
        &self,
        pipeline_branch: &str,
        integration_branch: &str,
    ) -> anyhow::Result<()> {
        self.delete_local_branch(pipeline_branch).await?;
        self.delete_remote_branch(pipeline_branch).await?;
        self.delete_local_branch(integration_branch).await?;
        self.delete_remote_branch(integration_branch).await?;
        Ok(())
    }

    /// `cleanup.stale_branch_days`: prune local branches under `prefixes`
    /// whose last commit is older than `max_age_days`, the way
    /// `factory/sandbox.rs::prune_stale_containers` sweeps containers past a
    /// max age. Branches still referenced by the manifest are the caller's
    /// responsibility to exclude — this only looks at the git ref itself.
    pub async fn prune_stale_branches(
        &self,
        prefixes: &[&str],
        max_age_days: u32,
        exclude: &std::collections::HashSet<String>,
    ) -> anyhow::Result<Vec<String>> {
        let output = Command::new("git")
            .args(["for-each-ref", "--format=%(refname:short) %(committerdate:unix)", "refs/heads/"])
            .current_dir(&self.repo_path)
            .output()
            .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().timestamp();
        let max_age_secs = i64::from(max_age_days) * 86_400;
        let mut pruned = Vec::new();

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some((branch, committed_at)) = line.rsplit_once(' ') else { continue };
            if !prefixes.iter().any(|prefix| branch.starts_with(prefix)) || exclude.contains(branch) {
                continue;
            }
            let Ok(committed_at) = committed_at.parse::<i64>() else { continue };
            if now - committed_at < max_age_secs {
                continue;
            }
            if self.delete_local_branch(branch).await.is_ok() {
                pruned.push(branch.to_string());
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        std::process::Command::new("git").arg("init").arg("-q").current_dir(dir).status().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(dir).status().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    fn branch_from_old_commit(dir: &Path, branch: &str, age_days: i64) {
        let head_output = std::process::Command::new("git")
            .args(["symbolic-ref", "--short", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        let original_branch = String::from_utf8_lossy(&head_output.stdout).trim().to_string();

        let old = chrono::Utc::now() - chrono::Duration::days(age_days);
        let date = old.to_rfc2822();
        std::process::Command::new("git")
            .args(["checkout", "-q", "-b", branch])
            .current_dir(dir)
            .status()
            .unwrap();
        std::fs::write(dir.join("a.txt"), format!("{branch}\n")).unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-am", "work"])
            .env("GIT_COMMITTER_DATE", &date)
            .env("GIT_AUTHOR_DATE", &date)
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["checkout", "-q", &original_branch])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    #[tokio::test]
    async fn prune_stale_branches_removes_old_unreferenced_branches() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        branch_from_old_commit(dir.path(), "pipeline/old", 30);
        branch_from_old_commit(dir.path(), "pipeline/fresh", 0);

        let cleaner = BranchCleaner::new(dir.path().to_path_buf(), false);
        let pruned = cleaner
            .prune_stale_branches(&["pipeline/"], 14, &std::collections::HashSet::new())
            .await
            .unwrap();

        assert_eq!(pruned, vec!["pipeline/old".to_string()]);
    }

    #[tokio::test]
    async fn prune_stale_branches_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        branch_from_old_commit(dir.path(), "pipeline/old", 30);

        let mut exclude = std::collections::HashSet::new();
        exclude.insert("pipeline/old".to_string());

        let cleaner = BranchCleaner::new(dir.path().to_path_buf(), false);
        let pruned = cleaner.prune_stale_branches(&["pipeline/"], 14, &exclude).await.unwrap();
        assert!(pruned.is_empty());
    }

    #[tokio::test]
    async fn deletes_local_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::process::Command::new("git")
            .args(["branch", "feature/x"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let cleaner = BranchCleaner::new(dir.path().to_path_buf(), false);
        cleaner.delete_local_branch("feature/x").await.unwrap();

        let output = std::process::Command::new("git")
            .args(["branch", "--list", "feature/x"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
    }

    #[tokio::test]
    async fn keep_on_failure_skips_deletion() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::process::Command::new("git")
            .args(["branch", "feature/y"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let cleaner = BranchCleaner::new(dir.path().to_path_buf(), true);
        cleaner.conditional_delete_on_failure(None, "feature/y").await.unwrap();

        let output = std::process::Command::new("git")
            .args(["branch", "--list", "feature/y"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(!String::from_utf8_lossy(&output.stdout).trim().is_empty());
    }
}
