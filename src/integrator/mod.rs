//! The Integrator: a saga with compensating actions (§4.8).
//!
//! Per Design Note 3, a `Vec<SagaStep>` where each step holds an `action`
//! and an optional `compensate` closure over a shared `&mut SagaContext`; a
//! linear executor tracks the highest completed index and unwinds in
//! reverse on failure. Step bodies generalize git plumbing from
//! `factory/agent_executor.rs`'s `setup_worktree`/`merge_branch`/
//! `cleanup_worktree` and `factory/pipeline.rs`'s `create_git_branch`/
//! `create_pull_request` shape (the latter replaced by a `reqwest`-based
//! GitHub REST call, see `forge_client.rs`).

pub mod conflict;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use branchline_common::manifest::ReadyEntry;
use branchline_common::{Event, EventKind, PipelineError};
use tokio::process::Command;

use crate::config::Config;
use crate::events::EventBus;
use crate::forge_client::{self, ForgeClient};
use crate::resilience::circuit_breaker::CircuitBreakers;

/// The plain record threaded through saga steps, mutated only by the
/// currently executing step.
pub struct SagaContext {
    pub entry: ReadyEntry,
    pub base_branch: String,
    pub integration_branch: String,
    pub worktree_path: PathBuf,
    pub base_main_sha: String,
    pub conflicted_files: Vec<String>,
    pub conflicts_resolved: bool,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
}

pub struct IntegrateOutcome {
    pub pr_number: u64,
    pub pr_url: String,
    pub integration_branch: String,
    pub base_main_sha: String,
    pub conflicts_resolved: bool,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type StepFn = for<'a> fn(&'a Integrator, &'a mut SagaContext) -> BoxFuture<'a, Result<(), PipelineError>>;

struct SagaStep {
    name: &'static str,
    action: StepFn,
    compensate: Option<StepFn>,
}

pub struct Integrator {
    repo_path: PathBuf,
    config: Arc<Config>,
    breakers: Arc<CircuitBreakers>,
    bus: Arc<EventBus>,
    github_token: Option<String>,
    owner_repo: Option<String>,
}

impl Integrator {
    pub fn new(
        repo_path: PathBuf,
        config: Arc<Config>,
        breakers: Arc<CircuitBreakers>,
        bus: Arc<EventBus>,
        github_token: Option<String>,
        owner_repo: Option<String>,
    ) -> Self {
        Self { repo_path, config, breakers, bus, github_token, owner_repo }
    }

    async fn run_git(&self, dir: &std::path::Path, args: &[&str]) -> Result<String, PipelineError> {
        let output = Command::new("git").args(args).current_dir(dir).output().await.map_err(|e| {
            PipelineError::ProcessFailure { command: format!("git {}", args.join(" ")), exit_code: None, stderr: e.to_string() }
        })?;
        if !output.status.success() {
            return Err(PipelineError::ProcessFailure {
                command: format!("git {}", args.join(" ")),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// §4.8.1 step 1: fetch origin's effective base branch, record its SHA.
    async fn fetch_main(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        self.run_git(&self.repo_path, &["fetch", "origin", &ctx.base_branch]).await?;
        let sha = self
            .run_git(&self.repo_path, &["rev-parse", &format!("origin/{}", ctx.base_branch)])
            .await?;
        ctx.base_main_sha = sha;
        Ok(())
    }

    /// §4.8.1 step 2: remove any leftover worktree/branch of the same name,
    /// then create a fresh one branching from `origin/<base>`.
    async fn create_integration_branch(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let worktree_str = ctx.worktree_path.to_string_lossy().to_string();
        let _ = self.run_git(&self.repo_path, &["worktree", "remove", "--force", &worktree_str]).await;
        let _ = self.run_git(&self.repo_path, &["branch", "-D", &ctx.integration_branch]).await;

        self.run_git(
            &self.repo_path,
            &[
                "worktree",
                "add",
                "-b",
                &ctx.integration_branch,
                &worktree_str,
                &format!("origin/{}", ctx.base_branch),
            ],
        )
        .await?;
        Ok(())
    }

    async fn compensate_create_integration_branch(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let worktree_str = ctx.worktree_path.to_string_lossy().to_string();
        let _ = self.run_git(&self.repo_path, &["worktree", "remove", "--force", &worktree_str]).await;
        let _ = self.run_git(&self.repo_path, &["branch", "-D", &ctx.integration_branch]).await;
        Ok(())
    }

    /// §4.8.1 step 3: non-fast-forward merge; on conflict, run the
    /// conflict-resolver agent (§4.8.2).
    async fn merge_pipeline(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let head_before =
            self.run_git(&ctx.worktree_path, &["rev-parse", "HEAD"]).await.unwrap_or_default();

        let pipeline_branch = ctx.entry.pipeline_branch.clone();
        let output = Command::new("git")
            .args(["merge", "--no-ff", "-m", &format!("Merge {pipeline_branch}"), &pipeline_branch])
            .current_dir(&ctx.worktree_path)
            .output()
            .await
            .map_err(|e| PipelineError::ProcessFailure {
                command: "git merge".to_string(),
                exit_code: None,
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            ctx.conflicts_resolved = false;
            return Ok(());
        }

        let conflicted = self
            .run_git(&ctx.worktree_path, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default();
        let conflicted_files: Vec<String> =
            conflicted.lines().map(|s| s.to_string()).filter(|s| !s.is_empty()).collect();
        ctx.conflicted_files = conflicted_files.clone();

        self.bus
            .publish(Event::new(
                EventKind::IntegrationConflictDetected,
                &ctx.entry.request_id,
                serde_json::json!({"branch": ctx.entry.branch, "count": conflicted_files.len()}),
            ))
            .await;

        let resolved = conflict::resolve_conflicts(
            &self.breakers,
            &self.config.claude_cmd,
            self.config.skip_permissions,
            &ctx.worktree_path,
            &ctx.integration_branch,
            &pipeline_branch,
            &conflicted_files,
            &head_before,
        )
        .await?;

        if !resolved {
            let _ = self.run_git(&ctx.worktree_path, &["merge", "--abort"]).await;
            return Err(PipelineError::MergeConflictUnresolved { files: conflicted_files });
        }

        ctx.conflicts_resolved = true;
        self.bus
            .publish(Event::new(
                EventKind::IntegrationConflictResolved,
                &ctx.entry.request_id,
                serde_json::json!({"branch": ctx.entry.branch}),
            ))
            .await;
        Ok(())
    }

    async fn compensate_merge_pipeline(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let _ = self.run_git(&ctx.worktree_path, &["merge", "--abort"]).await;
        Ok(())
    }

    /// §4.8.1 step 4: force-with-lease push, wrapped in the `forge` breaker.
    async fn push_branch(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let worktree_path = ctx.worktree_path.clone();
        let integration_branch = ctx.integration_branch.clone();
        self.breakers
            .forge
            .call(async move {
                self.run_git(
                    &worktree_path,
                    &["push", "--force-with-lease", "origin", &integration_branch],
                )
                .await
                .map(|_| ())
            })
            .await
    }

    async fn compensate_push_branch(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let _ = self
            .run_git(&self.repo_path, &["push", "origin", "--delete", &ctx.integration_branch])
            .await;
        Ok(())
    }

    /// §4.8.1 step 5: open a pull request via the forge, wrapped in the
    /// `forge` breaker. No compensation — the PR remains for operator review.
    async fn create_pr(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let (token, owner_repo) = match (&self.github_token, &self.owner_repo) {
            (Some(t), Some(o)) => (t.clone(), o.clone()),
            _ => {
                return Err(PipelineError::Validation(
                    "no GitHub token/remote configured for PR creation".to_string(),
                ));
            }
        };
        let client = ForgeClient::new(token, owner_repo);
        let title = format!("Integrate: {}", ctx.entry.branch);
        let agent_results = agent_results_from_pipeline_result(&ctx.entry.pipeline_result);
        let body = forge_client::render_pr_body(
            ctx.entry.tier.as_str(),
            &agent_results,
            &ctx.entry.corrections_applied,
            ctx.conflicts_resolved,
            &ctx.entry.request_id,
        );

        let integration_branch = ctx.integration_branch.clone();
        let base_branch = ctx.base_branch.clone();
        let pr = self
            .breakers
            .forge
            .call(async move {
                client
                    .create_pull_request(&integration_branch, &base_branch, &title, &body)
                    .await
                    .map_err(PipelineError::Other)
            })
            .await?;

        ctx.pr_number = Some(pr.number);
        ctx.pr_url = Some(pr.url);
        Ok(())
    }

    /// §4.8.1 step 6: remove the temp worktree. No compensation.
    async fn cleanup_worktree(&self, ctx: &mut SagaContext) -> Result<(), PipelineError> {
        let worktree_str = ctx.worktree_path.to_string_lossy().to_string();
        self.run_git(&self.repo_path, &["worktree", "remove", "--force", &worktree_str]).await?;
        Ok(())
    }

    fn steps() -> Vec<SagaStep> {
        fn fetch_main(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.fetch_main(c))
        }
        fn create_integration_branch(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.create_integration_branch(c))
        }
        fn compensate_create_integration_branch(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.compensate_create_integration_branch(c))
        }
        fn merge_pipeline(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.merge_pipeline(c))
        }
        fn compensate_merge_pipeline(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.compensate_merge_pipeline(c))
        }
        fn push_branch(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.push_branch(c))
        }
        fn compensate_push_branch(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.compensate_push_branch(c))
        }
        fn create_pr(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.create_pr(c))
        }
        fn cleanup_worktree(i: &Integrator, c: &mut SagaContext) -> BoxFuture<'_, Result<(), PipelineError>> {
            Box::pin(i.cleanup_worktree(c))
        }

        vec![
            SagaStep { name: "fetch_main", action: fetch_main, compensate: None },
            SagaStep {
                name: "create_integration_branch",
                action: create_integration_branch,
                compensate: Some(compensate_create_integration_branch),
            },
            SagaStep { name: "merge_pipeline", action: merge_pipeline, compensate: Some(compensate_merge_pipeline) },
            SagaStep { name: "push_branch", action: push_branch, compensate: Some(compensate_push_branch) },
            SagaStep { name: "create_pr", action: create_pr, compensate: None },
            SagaStep { name: "cleanup_worktree", action: cleanup_worktree, compensate: None },
        ]
    }

    /// Run the full integrate saga for a ready entry. On success returns
    /// the PR outputs the Director records via `moveToPendingMerge`; on
    /// failure, compensations for every previously-succeeded step have
    /// already run, plus an out-of-band worktree/branch cleanup safety net.
    pub async fn integrate(&self, entry: ReadyEntry) -> Result<IntegrateOutcome, PipelineError> {
        let base_branch = entry.base_branch.clone().unwrap_or_else(|| self.config.branch.main.clone());
        let integration_branch = format!("{}{}", self.config.branch.integration_prefix, entry.branch);
        let worktree_path = self.repo_path.join(".integration-worktrees").join(sanitize(&entry.branch));

        let mut ctx = SagaContext {
            entry: entry.clone(),
            base_branch,
            integration_branch: integration_branch.clone(),
            worktree_path,
            base_main_sha: String::new(),
            conflicted_files: Vec::new(),
            conflicts_resolved: false,
            pr_number: None,
            pr_url: None,
        };

        self.bus
            .publish(Event::new(EventKind::IntegrationStarted, &entry.request_id, serde_json::json!({"branch": entry.branch})))
            .await;

        let steps = Self::steps();
        let mut completed = 0usize;

        for (index, step) in steps.iter().enumerate() {
            match (step.action)(self, &mut ctx).await {
                Ok(()) => completed = index + 1,
                Err(e) => {
                    tracing::warn!(step = step.name, error = %e, "integration saga step failed, unwinding");
                    for j in (0..completed).rev() {
                        if let Some(compensate) = steps[j].compensate {
                            if let Err(comp_err) = compensate(self, &mut ctx).await {
                                tracing::error!(step = steps[j].name, error = %comp_err, "compensation failed");
                            }
                        }
                    }
                    let _ = self.force_cleanup(&ctx).await;
                    self.bus
                        .publish(Event::new(
                            EventKind::IntegrationFailed,
                            &entry.request_id,
                            serde_json::json!({"branch": entry.branch, "error": e.to_string()}),
                        ))
                        .await;
                    return Err(e);
                }
            }
        }

        let outcome = IntegrateOutcome {
            pr_number: ctx.pr_number.unwrap_or_default(),
            pr_url: ctx.pr_url.clone().unwrap_or_default(),
            integration_branch,
            base_main_sha: ctx.base_main_sha.clone(),
            conflicts_resolved: ctx.conflicts_resolved,
        };

        self.bus
            .publish(Event::new(
                EventKind::IntegrationPrCreated,
                &entry.request_id,
                serde_json::json!({
                    "branch": entry.branch,
                    "pr_number": outcome.pr_number,
                    "pr_url": outcome.pr_url,
                }),
            ))
            .await;

        Ok(outcome)
    }

    /// Safety net run after any saga failure, regardless of which
    /// compensations already ran, since a worktree can be left behind by a
    /// step that partially succeeded before erroring.
    async fn force_cleanup(&self, ctx: &SagaContext) -> Result<(), PipelineError> {
        let worktree_str = ctx.worktree_path.to_string_lossy().to_string();
        let _ = self.run_git(&self.repo_path, &["worktree", "remove", "--force", &worktree_str]).await;
        let _ = self.run_git(&self.repo_path, &["branch", "-D", &ctx.integration_branch]).await;
        Ok(())
    }

    /// §4.8.3: rebase path, independent of the integrate saga.
    pub async fn rebase(&self, entry: &ReadyEntry, integration_branch: &str, new_base: &str) -> Result<(String, bool), PipelineError> {
        self.run_git(&self.repo_path, &["fetch", "origin", &self.config.branch.main]).await?;
        self.run_git(&self.repo_path, &["checkout", integration_branch]).await?;

        let head_before = self.run_git(&self.repo_path, &["rev-parse", "HEAD"]).await.unwrap_or_default();
        let rebase = Command::new("git")
            .args(["rebase", &format!("origin/{new_base}")])
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| PipelineError::ProcessFailure {
                command: "git rebase".to_string(),
                exit_code: None,
                stderr: e.to_string(),
            })?;

        let mut conflicts_resolved = false;
        if !rebase.status.success() {
            let conflicted = self
                .run_git(&self.repo_path, &["diff", "--name-only", "--diff-filter=U"])
                .await
                .unwrap_or_default();
            let conflicted_files: Vec<String> =
                conflicted.lines().map(|s| s.to_string()).filter(|s| !s.is_empty()).collect();

            let resolved = conflict::resolve_conflicts(
                &self.breakers,
                &self.config.claude_cmd,
                self.config.skip_permissions,
                &self.repo_path,
                integration_branch,
                &entry.pipeline_branch,
                &conflicted_files,
                &head_before,
            )
            .await;

            let resolved = match resolved {
                Ok(true) => {
                    self.run_git(&self.repo_path, &["rebase", "--continue"]).await?;
                    true
                }
                _ => false,
            };

            if !resolved {
                let _ = self.run_git(&self.repo_path, &["rebase", "--abort"]).await;
                let _ = self.run_git(&self.repo_path, &["checkout", &self.config.branch.main]).await;
                self.bus
                    .publish(Event::new(
                        EventKind::IntegrationPrRebaseFailed,
                        &entry.request_id,
                        serde_json::json!({"branch": entry.branch}),
                    ))
                    .await;
                return Err(PipelineError::RebaseFailed {
                    branch: integration_branch.to_string(),
                    new_base: new_base.to_string(),
                    reason: "conflicts could not be auto-resolved".to_string(),
                });
            }
            conflicts_resolved = true;
        }

        self.breakers
            .forge
            .call(async {
                self.run_git(&self.repo_path, &["push", "--force-with-lease", "origin", integration_branch])
                    .await
                    .map(|_| ())
            })
            .await?;

        let new_head = self.run_git(&self.repo_path, &["rev-parse", "HEAD"]).await?;
        self.run_git(&self.repo_path, &["checkout", &self.config.branch.main]).await?;

        self.bus
            .publish(Event::new(
                EventKind::IntegrationPrRebased,
                &entry.request_id,
                serde_json::json!({"branch": entry.branch, "new_base_sha": new_head, "conflicts_resolved": conflicts_resolved}),
            ))
            .await;

        Ok((new_head, conflicts_resolved))
    }
}

/// Build the PR body's `| Agent | Status | Details |` rows from the ready
/// entry's `pipeline_result` record (the enriched `pipeline.completed`
/// event data, per §4.5.5). Every dispatched agent ran to completion by
/// the time a branch reaches `ready` — only successful runs are promoted.
fn agent_results_from_pipeline_result(pipeline_result: &serde_json::Value) -> Vec<(String, String, String)> {
    let agents = pipeline_result
        .get("agents_dispatched")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let num_turns = pipeline_result.get("num_turns").and_then(|v| v.as_u64());

    agents
        .iter()
        .filter_map(|v| v.as_str())
        .map(|name| {
            let details = match num_turns {
                Some(turns) => format!("{turns} turns"),
                None => "-".to_string(),
            };
            (name.to_string(), "completed".to_string(), details)
        })
        .collect()
}

fn sanitize(branch: &str) -> String {
    branch.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_agent_rows_from_dispatched_list() {
        let pipeline_result = serde_json::json!({
            "agents_dispatched": ["implementer", "reviewer"],
            "num_turns": 12,
        });
        let rows = agent_results_from_pipeline_result(&pipeline_result);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("implementer".to_string(), "completed".to_string(), "12 turns".to_string()));
    }

    #[test]
    fn missing_agents_dispatched_yields_empty_rows() {
        let rows = agent_results_from_pipeline_result(&serde_json::json!({}));
        assert!(rows.is_empty());
    }

    #[test]
    fn sanitize_replaces_slashes() {
        assert_eq!(sanitize("feature/login"), "feature-login");
    }
}
