//! Director: serialises ready-branch progression into the Integrator, on a
//! cron-like interval and reactively (debounced) off `pipeline.completed`.
//!
//! Grounded on `orchestrator/scheduler.rs`'s "single in-flight flag plus a
//! debounced notify" pattern (there: debounced re-plan after a file-watch
//! event), generalized to §4.7's priority/dependency selection over the
//! manifest's `ready` list.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use branchline_common::manifest::ReadyEntry;
use branchline_common::{Event, EventKind};
use tokio::sync::Notify;

use crate::cleanup::BranchCleaner;
use crate::config::Config;
use crate::events::EventBus;
use crate::integrator::Integrator;
use crate::manifest::{ManifestManager, MovedToPendingMerge};

pub struct Director {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    manifest: Arc<ManifestManager>,
    integrator: Arc<Integrator>,
    cleaner: Arc<BranchCleaner>,
    running: AtomicBool,
    trigger: Notify,
}

impl Director {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        manifest: Arc<ManifestManager>,
        integrator: Arc<Integrator>,
        cleaner: Arc<BranchCleaner>,
    ) -> Self {
        Self { config, bus, manifest, integrator, cleaner, running: AtomicBool::new(false), trigger: Notify::new() }
    }

    /// Reactive entry point: `pipeline.completed`'s handler debounces by
    /// `director.auto_trigger_delay_ms` before calling this.
    pub fn request_cycle(&self) {
        self.trigger.notify_one();
    }

    /// Drives both the interval schedule and the reactive trigger for the
    /// lifetime of the process. Intended to be spawned as a background task.
    pub async fn run_forever(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.director.schedule_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notified() => {}
            }
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "director cycle failed");
            }
        }
    }

    /// One cycle of §4.7. Mutually exclusive via `running`: a cycle already
    /// in flight causes this call to no-op rather than queue up.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.run_cycle_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle_inner(&self) -> anyhow::Result<()> {
        self.bus.publish(Event::new(EventKind::DirectorActivated, "director", serde_json::json!({}))).await;

        let new_main_head = self.fetch_main_head().await?;
        self.check_stale_pending_merges(&new_main_head).await;

        let history = self.manifest.merge_history_snapshot().await;
        let merged: std::collections::HashSet<String> =
            history.iter().map(|h| h.pending.ready.branch.clone()).collect();

        let ready = self.manifest.ready_snapshot().await;
        if let Some(selected) = select_next(&ready, &merged) {
            self.dispatch(selected).await;
        }

        self.prune_stale_branches().await;

        self.manifest.update_main_head(&new_main_head).await?;
        self.bus.publish(Event::new(EventKind::DirectorCycleCompleted, "director", serde_json::json!({}))).await;
        Ok(())
    }

    async fn fetch_main_head(&self) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("git")
            .args(["ls-remote", "origin", &format!("refs/heads/{}", self.config.branch.main)])
            .output()
            .await?;
        let line = String::from_utf8_lossy(&output.stdout);
        let sha = line.split_whitespace().next().unwrap_or_default().to_string();
        if sha.is_empty() {
            anyhow::bail!("could not resolve origin/{} head", self.config.branch.main);
        }
        Ok(sha)
    }

    /// §4.7 step 2: any pending-merge entry whose recorded `base_main_sha`
    /// has drifted from the new main head needs a rebase.
    async fn check_stale_pending_merges(&self, new_main_head: &str) {
        for entry in self.manifest.pending_merge_snapshot().await {
            if entry.ready.base_main_sha != new_main_head {
                self.bus
                    .publish(Event::new(
                        EventKind::DirectorPrRebaseNeeded,
                        &entry.ready.request_id,
                        serde_json::json!({"branch": entry.ready.branch, "new_base": new_main_head}),
                    ))
                    .await;
            }
        }
    }

    /// `cleanup.stale_branch_days`: sweep local pipeline/integration branches
    /// that have gone quiet, excluding anything the manifest still tracks —
    /// a ready or pending-merge branch is active regardless of its git age.
    async fn prune_stale_branches(&self) {
        let days = self.config.cleanup.stale_branch_days;
        if days == 0 {
            return;
        }
        let active: std::collections::HashSet<String> = self
            .manifest
            .ready_snapshot()
            .await
            .iter()
            .map(|e| e.pipeline_branch.clone())
            .chain(self.manifest.pending_merge_snapshot().await.iter().flat_map(|e| {
                [e.ready.pipeline_branch.clone(), e.integration_branch.clone()]
            }))
            .collect();

        let prefixes = [self.config.branch.pipeline_prefix.as_str(), self.config.branch.integration_prefix.as_str()];
        match self.cleaner.prune_stale_branches(&prefixes, days, &active).await {
            Ok(pruned) => {
                for branch in &pruned {
                    tracing::info!(branch, "pruned stale branch");
                }
            }
            Err(e) => tracing::warn!(error = %e, "stale branch prune failed"),
        }
    }

    async fn dispatch(&self, entry: ReadyEntry) {
        self.bus
            .publish(Event::new(
                EventKind::DirectorIntegrationDispatched,
                &entry.request_id,
                serde_json::json!({"branch": entry.branch}),
            ))
            .await;

        let branch = entry.branch.clone();
        let request_id = entry.request_id.clone();
        match self.integrator.integrate(entry).await {
            Ok(outcome) => {
                let _ = self
                    .manifest
                    .move_to_pending_merge(
                        &branch,
                        MovedToPendingMerge {
                            pr_number: outcome.pr_number,
                            pr_url: outcome.pr_url.clone(),
                            integration_branch: outcome.integration_branch.clone(),
                            base_main_sha: outcome.base_main_sha.clone(),
                        },
                    )
                    .await;
                self.bus
                    .publish(Event::new(
                        EventKind::DirectorIntegrationPrCreated,
                        &request_id,
                        serde_json::json!({"branch": branch, "pr_number": outcome.pr_number, "pr_url": outcome.pr_url}),
                    ))
                    .await;
            }
            Err(e) => {
                self.bus
                    .publish(Event::new(
                        EventKind::DirectorIntegrationFailed,
                        &request_id,
                        serde_json::json!({"branch": branch, "error": e.to_string()}),
                    ))
                    .await;
            }
        }
    }
}

/// §4.7 step 3 + tie-break rules: highest `priority`, then earliest
/// `ready_at`, then lexicographically smallest `branch`, restricted to
/// entries whose `depends_on` are all present in `merge_history`.
fn select_next(ready: &[ReadyEntry], merged: &std::collections::HashSet<String>) -> Option<ReadyEntry> {
    ready
        .iter()
        .filter(|entry| entry.depends_on.iter().all(|dep| merged.contains(dep)))
        .min_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.ready_at.cmp(&b.ready_at))
                .then_with(|| a.branch.cmp(&b.branch))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchline_common::Tier;
    use std::collections::HashSet;

    fn entry(branch: &str, priority: i64, depends_on: &[&str]) -> ReadyEntry {
        ReadyEntry {
            branch: branch.to_string(),
            pipeline_branch: format!("pipeline/{branch}"),
            worktree_path: format!("/w/{branch}"),
            request_id: format!("r-{branch}"),
            tier: Tier::Small,
            pipeline_result: serde_json::json!({}),
            corrections_applied: vec![],
            ready_at: chrono::Utc::now(),
            priority,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            base_main_sha: "sha".to_string(),
            base_branch: Some("main".to_string()),
            metadata: None,
        }
    }

    #[test]
    fn higher_priority_wins() {
        let ready = vec![entry("a", 1, &[]), entry("b", 5, &[])];
        let merged = HashSet::new();
        let selected = select_next(&ready, &merged).unwrap();
        assert_eq!(selected.branch, "b");
    }

    #[test]
    fn equal_priority_breaks_on_branch_name() {
        let ready = vec![entry("zzz", 1, &[]), entry("aaa", 1, &[])];
        let merged = HashSet::new();
        let selected = select_next(&ready, &merged).unwrap();
        assert_eq!(selected.branch, "aaa");
    }

    #[test]
    fn unsatisfied_dependency_is_skipped() {
        let ready = vec![entry("child", 10, &["parent"])];
        let merged = HashSet::new();
        assert!(select_next(&ready, &merged).is_none());
    }

    #[test]
    fn satisfied_dependency_is_selected() {
        let ready = vec![entry("child", 10, &["parent"])];
        let mut merged = HashSet::new();
        merged.insert("parent".to_string());
        let selected = select_next(&ready, &merged).unwrap();
        assert_eq!(selected.branch, "child");
    }
}
