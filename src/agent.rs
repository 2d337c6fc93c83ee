//! Spawns the code-generation agent subprocess and streams its NDJSON
//! output line by line.
//!
//! Lifted from `swarm/executor.rs::run_claude_process`: piped stdin/stdout,
//! `--print --output-format stream-json`, write the prompt then shut down
//! stdin, read stdout with a line-buffered reader on a background task so
//! the caller never blocks waiting on the whole process. Shared by the
//! PipelineRunner (§4.5.2) and the Integrator's conflict-resolver agent
//! invocation (§4.8.2), which is exactly the spawn path both components use.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub struct SpawnedAgent {
    pub child: Child,
    pub lines: mpsc::Receiver<String>,
}

/// Spawn `cmd` against `working_dir`, write `prompt` to stdin, and stream
/// stdout lines back over a channel. Stderr is inherited so agent errors
/// surface in the host's own logs.
pub async fn spawn(
    cmd: &str,
    working_dir: &Path,
    prompt: &str,
    skip_permissions: bool,
) -> anyhow::Result<SpawnedAgent> {
    let mut command = Command::new(cmd);
    command.arg("--print").arg("--output-format").arg("stream-json");
    if skip_permissions {
        command.arg("--dangerously-skip-permissions");
    }
    command
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|e| anyhow::anyhow!("failed to spawn agent process: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("agent process has no stdout"))?;
    let reader = BufReader::new(stdout);
    let (tx, rx) = mpsc::channel::<String>(1000);

    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading agent stdout");
                    break;
                }
            }
        }
    });

    Ok(SpawnedAgent { child, lines: rx })
}
