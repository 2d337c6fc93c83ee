//! §4.9 reactive wiring: the handlers that turn PipelineRunner/Integrator/
//! webhook events into ManifestManager/IdempotencyGuard/BranchCleaner/
//! Director side effects. Enumerated as a single `install` call (Design Note
//! 6: the wiring is data, not scattered call sites) rather than each
//! component subscribing to itself, the way `orchestrator/signals.rs` wires
//! its handler table in one place at startup.

use std::sync::Arc;
use std::time::Duration;

use branchline_common::manifest::ReadyEntry;
use branchline_common::{Event, EventKind};

use crate::cleanup::BranchCleaner;
use crate::config::Config;
use crate::director::Director;
use crate::events::{EventBus, EventHandler};
use crate::idempotency::IdempotencyGuard;
use crate::integrator::Integrator;
use crate::manifest::ManifestManager;

/// Register every §4.9 handler on `bus`. Call once at startup, after every
/// collaborator has been constructed.
pub async fn install(
    bus: &Arc<EventBus>,
    config: Arc<Config>,
    manifest: Arc<ManifestManager>,
    idempotency: Arc<IdempotencyGuard>,
    cleaner: Arc<BranchCleaner>,
    director: Arc<Director>,
    integrator: Arc<Integrator>,
) {
    bus.on(
        EventKind::PipelineCompleted,
        Arc::new(OnPipelineCompleted {
            config: config.clone(),
            manifest: manifest.clone(),
            cleaner: cleaner.clone(),
            director: director.clone(),
        }),
    )
    .await;

    let release = Arc::new(ReleaseIdempotency { idempotency });
    bus.on(EventKind::PipelineCompleted, release.clone()).await;
    bus.on(EventKind::PipelineFailed, release.clone()).await;
    bus.on(EventKind::PipelineStopped, release).await;

    bus.on(EventKind::PipelineFailed, Arc::new(OnPipelineFailed { cleaner: cleaner.clone() })).await;

    bus.on(
        EventKind::DirectorPrRebaseNeeded,
        Arc::new(OnRebaseNeeded { manifest: manifest.clone(), integrator }),
    )
    .await;

    bus.on(EventKind::IntegrationPrMerged, Arc::new(OnIntegrationMerged { manifest, cleaner })).await;
}

fn string_field(data: &serde_json::Value, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

struct OnPipelineCompleted {
    config: Arc<Config>,
    manifest: Arc<ManifestManager>,
    cleaner: Arc<BranchCleaner>,
    director: Arc<Director>,
}

#[async_trait::async_trait]
impl EventHandler for OnPipelineCompleted {
    fn name(&self) -> &str {
        "wiring::pipeline_completed"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let data = &event.data;
        let (Some(branch), Some(pipeline_branch), Some(worktree_path)) = (
            string_field(data, "branch"),
            string_field(data, "pipeline_branch"),
            string_field(data, "worktree_path"),
        ) else {
            tracing::warn!(request_id = %event.request_id, "pipeline.completed missing enriched fields");
            return Ok(());
        };
        let base_branch = string_field(data, "base_branch");
        let tier = data
            .get("tier")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(branchline_common::Tier::Small);
        let corrections_applied = data
            .get("corrections_applied")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let priority = event
            .metadata
            .as_ref()
            .and_then(|m| m.get("priority"))
            .and_then(|v| v.as_i64())
            .unwrap_or(self.config.director.default_priority);
        let depends_on = event
            .metadata
            .as_ref()
            .and_then(|m| m.get("depends_on"))
            .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
            .unwrap_or_default();

        let entry = ReadyEntry {
            branch: branch.clone(),
            pipeline_branch: pipeline_branch.clone(),
            worktree_path: worktree_path.clone(),
            request_id: event.request_id.clone(),
            tier,
            pipeline_result: data.clone(),
            corrections_applied,
            ready_at: event.timestamp,
            priority,
            depends_on,
            base_main_sha: self.manifest.get_main_head().await,
            base_branch,
            metadata: event.metadata.clone(),
        };
        self.manifest.add_to_ready(entry).await?;

        let delay = Duration::from_millis(self.config.director.auto_trigger_delay_ms);
        let cleaner = self.cleaner.clone();
        let director = self.director.clone();
        let worktree_for_delete = worktree_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = cleaner.delete_pipeline_branch(Some(std::path::Path::new(&worktree_for_delete)), &pipeline_branch).await {
                tracing::warn!(error = %e, branch = pipeline_branch, "failed to clean up completed pipeline branch");
            }
            director.request_cycle();
        });

        Ok(())
    }
}

struct ReleaseIdempotency {
    idempotency: Arc<IdempotencyGuard>,
}

#[async_trait::async_trait]
impl EventHandler for ReleaseIdempotency {
    fn name(&self) -> &str {
        "wiring::release_idempotency"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let Some(branch) = string_field(&event.data, "branch") {
            self.idempotency.release(&branch);
        }
        Ok(())
    }
}

struct OnPipelineFailed {
    cleaner: Arc<BranchCleaner>,
}

#[async_trait::async_trait]
impl EventHandler for OnPipelineFailed {
    fn name(&self) -> &str {
        "wiring::pipeline_failed_cleanup"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let Some(pipeline_branch) = string_field(&event.data, "pipeline_branch") else { return Ok(()) };
        let worktree_path = string_field(&event.data, "worktree_path");
        let worktree_path = worktree_path.as_deref().map(std::path::Path::new);
        if let Err(e) = self.cleaner.conditional_delete_on_failure(worktree_path, &pipeline_branch).await {
            tracing::warn!(error = %e, branch = pipeline_branch, "failed to apply cleanup-on-failure policy");
        }
        Ok(())
    }
}

struct OnRebaseNeeded {
    manifest: Arc<ManifestManager>,
    integrator: Arc<Integrator>,
}

#[async_trait::async_trait]
impl EventHandler for OnRebaseNeeded {
    fn name(&self) -> &str {
        "wiring::rebase_needed"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let Some(branch) = string_field(&event.data, "branch") else { return Ok(()) };
        let Some(new_base) = string_field(&event.data, "new_base") else { return Ok(()) };

        let pending = self
            .manifest
            .pending_merge_snapshot()
            .await
            .into_iter()
            .find(|e| e.ready.branch == branch);
        let Some(pending) = pending else {
            tracing::warn!(branch, "rebase-needed event for a branch no longer pending merge");
            return Ok(());
        };

        match self.integrator.rebase(&pending.ready, &pending.integration_branch, &new_base).await {
            Ok((new_head_sha, _conflicts_resolved)) => {
                self.manifest.update_pending_merge_base_sha(&branch, &new_head_sha).await?;
            }
            Err(e) => {
                tracing::error!(error = %e, branch, "rebase failed, will retry on next director cycle");
            }
        }
        Ok(())
    }
}

struct OnIntegrationMerged {
    manifest: Arc<ManifestManager>,
    cleaner: Arc<BranchCleaner>,
}

#[async_trait::async_trait]
impl EventHandler for OnIntegrationMerged {
    fn name(&self) -> &str {
        "wiring::integration_merged"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let data = &event.data;
        let (Some(branch), Some(pipeline_branch), Some(integration_branch)) = (
            string_field(data, "branch"),
            string_field(data, "pipeline_branch"),
            string_field(data, "integration_branch"),
        ) else {
            tracing::warn!("integration.pr.merged event missing required fields");
            return Ok(());
        };
        let commit_sha = string_field(data, "commit_sha").unwrap_or_default();

        self.manifest.move_to_merge_history(&branch, &commit_sha).await?;
        self.cleaner.cleanup_after_merge(&pipeline_branch, &integration_branch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ready(branch: &str) -> ReadyEntry {
        ReadyEntry {
            branch: branch.to_string(),
            pipeline_branch: format!("pipeline/{branch}"),
            worktree_path: format!("/w/{branch}"),
            request_id: "r1".to_string(),
            tier: branchline_common::Tier::Small,
            pipeline_result: serde_json::json!({}),
            corrections_applied: vec![],
            ready_at: chrono::Utc::now(),
            priority: 0,
            depends_on: vec![],
            base_main_sha: "sha-a".to_string(),
            base_branch: Some("main".to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn integration_merged_moves_history_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "t@example.com"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "t"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let manifest = Arc::new(ManifestManager::load(dir.path().join("manifest.json")).await.unwrap());
        manifest.add_to_ready(sample_ready("feature/login")).await.unwrap();
        manifest
            .move_to_pending_merge(
                "feature/login",
                crate::manifest::MovedToPendingMerge {
                    pr_number: 1,
                    pr_url: "url".into(),
                    integration_branch: "integration/feature/login".into(),
                    base_main_sha: "sha-a".into(),
                },
            )
            .await
            .unwrap();

        let cleaner = Arc::new(BranchCleaner::new(dir.path().to_path_buf(), false));
        let handler = OnIntegrationMerged { manifest: manifest.clone(), cleaner };

        let event = Event::new(
            EventKind::IntegrationPrMerged,
            "feature/login",
            serde_json::json!({
                "branch": "feature/login",
                "pipeline_branch": "pipeline/feature/login",
                "integration_branch": "integration/feature/login",
                "commit_sha": "sha-commit",
            }),
        );
        handler.handle(&event).await.unwrap();

        assert!(manifest.pending_merge_snapshot().await.is_empty());
        let history = manifest.merge_history_snapshot().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].commit_sha, "sha-commit");
    }

    #[tokio::test]
    async fn release_idempotency_handler_releases_branch() {
        let dir = tempfile::tempdir().unwrap();
        let guard = IdempotencyGuard::new(dir.path().join("active.json"));
        guard.register("feature/x", "r1");

        let handler = ReleaseIdempotency { idempotency: guard.clone() };
        let event = Event::new(EventKind::PipelineCompleted, "r1", serde_json::json!({"branch": "feature/x"}));
        handler.handle(&event).await.unwrap();

        assert!(!guard.check("feature/x").is_duplicate);
    }
}
