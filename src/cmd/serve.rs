//! `branchline serve` — the combined long-running service: everything
//! `director` runs, plus the inbound webhook HTTP surface (§6) that lets an
//! external forge notify this process when an integration PR merges.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::cmd::director::build_stack;
use crate::config::Config;
use crate::webhook::InboundServer;

pub async fn cmd_serve(
    project_dir: PathBuf,
    repo_path: PathBuf,
    config: Config,
    github_token: Option<String>,
    remote_url: Option<String>,
    bind_addr: SocketAddr,
) -> Result<()> {
    let config = Arc::new(config);
    let stack = build_stack(&project_dir, repo_path, config.clone(), github_token, remote_url).await?;

    let _dlq_task = stack.dlq.clone().spawn_retry_loop();
    let director_task = tokio::spawn(stack.director.clone().run_forever());
    let inbound = InboundServer::spawn(bind_addr, stack.bus.clone()).await?;

    tracing::info!(%bind_addr, "serve running: director cycle, dlq retry loop, inbound webhook");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down serve");
    director_task.abort();
    inbound.shutdown().await;
    Ok(())
}
