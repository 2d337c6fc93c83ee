//! The conflict-resolution agent invocation (§4.8.2).
//!
//! Reuses the same agent-subprocess-spawn path as the PipelineRunner
//! (`crate::agent::spawn`) rather than a separate implementation — grounded
//! on `swarm/executor.rs::run_claude_process`'s spawn pattern and
//! `review/arbiter.rs`'s dispatch-then-await-result shape for a
//! single-shot, non-streaming agent call.

use std::path::Path;

use branchline_common::PipelineError;
use tokio::process::Command;

use crate::resilience::circuit_breaker::CircuitBreakers;

/// Invoke the conflict-resolver agent against `worktree_path`, already
/// `git merge`d into a conflicted state. Returns whether the agent both
/// reported success on its result message *and* actually left a clean,
/// committed tree — Open Question decision #4: a missing commit is treated
/// as failure, not silent success.
pub async fn resolve_conflicts(
    breakers: &CircuitBreakers,
    claude_cmd: &str,
    skip_permissions: bool,
    worktree_path: &Path,
    integration_branch: &str,
    pipeline_branch: &str,
    conflicted_files: &[String],
    head_before: &str,
) -> Result<bool, PipelineError> {
    let prompt = build_conflict_prompt(integration_branch, pipeline_branch, conflicted_files);

    let claude_cmd_owned = claude_cmd.to_string();
    let worktree_path_owned = worktree_path.to_path_buf();
    let agent_reported_success = breakers
        .agent
        .call(async move {
            run_to_completion(&claude_cmd_owned, &worktree_path_owned, &prompt, skip_permissions)
                .await
                .map_err(PipelineError::Other)
        })
        .await?;

    if !agent_reported_success {
        return Ok(false);
    }

    verify_resolution_committed(worktree_path, head_before).await
}

fn build_conflict_prompt(integration_branch: &str, pipeline_branch: &str, conflicted_files: &[String]) -> String {
    format!(
        "You are resolving merge conflicts on branch `{integration_branch}` after merging in \
         `{pipeline_branch}`. Conflicted files: {}.\n\
         1. Read each conflicted file.\n\
         2. Resolve conflict markers semantically, preferring the `{pipeline_branch}` side when \
            changes are contradictory.\n\
         3. Stage all resolved files.\n\
         4. Commit with the message `fix(integration): resolve merge conflicts for {pipeline_branch}`.\n\
         5. Remain on the current branch.\n",
        conflicted_files.join(", "),
    )
}

/// Run the agent to completion and return whether its final `result`
/// message reported success (`is_error == false`).
async fn run_to_completion(
    claude_cmd: &str,
    worktree_path: &Path,
    prompt: &str,
    skip_permissions: bool,
) -> anyhow::Result<bool> {
    let mut spawned = crate::agent::spawn(claude_cmd, worktree_path, prompt, skip_permissions).await?;
    let mut success = false;
    while let Some(line) = spawned.lines.recv().await {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else { continue };
        if value.get("type").and_then(|v| v.as_str()) == Some("result") {
            success = !value.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
        }
    }
    let _ = spawned.child.wait().await;
    Ok(success)
}

/// Open Question decision #4: after the agent claims success, confirm the
/// worktree has no unstaged/uncommitted changes and that HEAD actually
/// moved from `head_before`. Either check failing treats the step as
/// `MergeConflictUnresolved` rather than trusting the agent's self-report.
async fn verify_resolution_committed(worktree_path: &Path, head_before: &str) -> Result<bool, PipelineError> {
    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(worktree_path)
        .output()
        .await
        .map_err(|e| PipelineError::ProcessFailure {
            command: "git status".to_string(),
            exit_code: None,
            stderr: e.to_string(),
        })?;
    if !String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        return Ok(false);
    }

    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(worktree_path)
        .output()
        .await
        .map_err(|e| PipelineError::ProcessFailure {
            command: "git rev-parse HEAD".to_string(),
            exit_code: None,
            stderr: e.to_string(),
        })?;
    let head_after = String::from_utf8_lossy(&head.stdout).trim().to_string();

    Ok(head_after != head_before && !head_after.is_empty())
}
