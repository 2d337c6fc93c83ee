//! CLI-level integration tests: `assert_cmd` against a temp project
//! directory exercising this crate's `run`/`init`/`manifest show` surface.
//!
//! The happy-path run test (S1) drives the real CLI end to end against a
//! stub agent binary that emits the documented NDJSON message sequence,
//! rather than mocking `PipelineRunner` itself.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn branchline() -> Command {
    Command::cargo_bin("branchline").unwrap()
}

fn init_project(dir: &TempDir) {
    branchline().current_dir(dir.path()).arg("init").assert().success();
}

/// Write an executable shell script standing in for the `claude` binary,
/// emitting one NDJSON line per argument to stdout.
fn write_stub_agent(dir: &TempDir, lines: &[serde_json::Value]) -> std::path::PathBuf {
    let script_path = dir.path().join("stub-agent.sh");
    let mut body = String::from("#!/bin/sh\ncat > /dev/null\n");
    for line in lines {
        body.push_str(&format!("echo '{}'\n", line));
    }
    let mut file = std::fs::File::create(&script_path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    file.set_permissions(perms).unwrap();
    script_path
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_succeeds() {
        branchline().arg("--help").assert().success();
    }

    #[test]
    fn run_without_init_still_works_from_defaults() {
        let dir = TempDir::new().unwrap();
        // `run` loads defaults when no .branchline/branchline.toml exists,
        // but the agent binary ("claude") won't be found on PATH, so the
        // pipeline is expected to fail, not panic.
        let worktree = dir.path().join("w");
        std::fs::create_dir_all(&worktree).unwrap();
        branchline()
            .current_dir(dir.path())
            .args(["run", "feature/missing-agent", worktree.to_str().unwrap()])
            .assert()
            .code(1);
    }
}

mod init_cmd {
    use super::*;

    #[test]
    fn creates_config_and_state_dir() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        assert!(dir.path().join(".branchline/branchline.toml").exists());
        assert!(dir.path().join(".pipeline").is_dir());
    }

    #[test]
    fn is_idempotent() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        branchline()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }
}

mod manifest_cmd {
    use super::*;

    #[test]
    fn show_on_fresh_project_prints_empty_lists() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        branchline()
            .current_dir(dir.path())
            .args(["manifest", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"ready\": []"))
            .stdout(predicate::str::contains("\"pending_merge\": []"))
            .stdout(predicate::str::contains("\"merge_history\": []"));
    }
}

mod run_cmd {
    use super::*;

    /// S1 — happy path: `system:init`, one `Task` dispatch, then a
    /// successful `result`. Expected terminal status: approved.
    #[test]
    fn happy_path_run_reports_approved() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        let worktree = dir.path().join("w");
        std::fs::create_dir_all(&worktree).unwrap();

        let stub = write_stub_agent(
            &dir,
            &[
                serde_json::json!({"type": "system", "subtype": "init", "session_id": "s1", "model": "claude"}),
                serde_json::json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
                }),
                serde_json::json!({
                    "type": "result", "subtype": "success", "result": "ok", "is_error": false,
                    "duration_ms": 10, "num_turns": 1, "total_cost_usd": 0.0
                }),
            ],
        );

        branchline()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", stub.to_str().unwrap())
            .args(["run", "feature/login", worktree.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Approved"));
    }

    /// S2 — correction cycle: one correction round before the final
    /// success result.
    #[test]
    fn correction_cycle_run_still_reports_approved() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        let worktree = dir.path().join("w");
        std::fs::create_dir_all(&worktree).unwrap();

        let stub = write_stub_agent(
            &dir,
            &[
                serde_json::json!({"type": "system", "subtype": "init", "session_id": "s1", "model": "claude"}),
                serde_json::json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
                }),
                serde_json::json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "text", "text": "Starting correction cycle 1: re-running failing agents"}]}
                }),
                serde_json::json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "tool_use", "id": "tu2", "name": "Task", "input": {}}]}
                }),
                serde_json::json!({
                    "type": "result", "subtype": "success", "result": "ok", "is_error": false,
                    "duration_ms": 10, "num_turns": 2, "total_cost_usd": 0.0
                }),
            ],
        );

        branchline()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", stub.to_str().unwrap())
            .args(["run", "feature/corrected", worktree.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Approved"))
            .stdout(predicate::str::contains("corrections: 1"));
    }

    #[test]
    fn rejects_reserved_pipeline_prefix_branch() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let worktree = dir.path().join("w");
        std::fs::create_dir_all(&worktree).unwrap();

        branchline()
            .current_dir(dir.path())
            .args(["run", "pipeline/already-prefixed", worktree.to_str().unwrap()])
            .assert()
            .failure();
    }
}
