//! `branchline director` — the long-running scheduler process: builds the
//! full component graph, installs the §4.9 reactive wiring, and drives the
//! Director's interval/reactive cycle plus the DLQ retry sweep until
//! interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::cleanup::BranchCleaner;
use crate::config::Config;
use crate::director::Director;
use crate::events::EventBus;
use crate::forge_client::parse_owner_repo_from_url;
use crate::idempotency::IdempotencyGuard;
use crate::integrator::Integrator;
use crate::manifest::ManifestManager;
use crate::resilience::circuit_breaker::CircuitBreakers;
use crate::resilience::dlq::DeadLetterQueue;
use crate::webhook::outbound::{DirectDeliveryHandler, WebhookAdapter};

/// Every long-lived collaborator a daemon-style subcommand needs, assembled
/// once and shared across the director loop, the DLQ retry loop, and (for
/// `serve`) the inbound webhook server.
pub struct Stack {
    pub bus: Arc<EventBus>,
    pub manifest: Arc<ManifestManager>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub dlq: Arc<DeadLetterQueue>,
    pub cleaner: Arc<BranchCleaner>,
    pub integrator: Arc<Integrator>,
    pub director: Arc<Director>,
}

/// Build every collaborator and install the reactive wiring. `repo_path` is
/// the git repository the Integrator and BranchCleaner operate against;
/// `github_token` is read from `GITHUB_TOKEN` by the caller.
pub async fn build_stack(
    project_dir: &Path,
    repo_path: PathBuf,
    config: Arc<Config>,
    github_token: Option<String>,
    remote_url: Option<String>,
) -> Result<Stack> {
    let bus = Arc::new(EventBus::new(config.events_path(project_dir)));
    let breakers = Arc::new(CircuitBreakers::new(
        &config.resilience.circuit_breaker.agent,
        &config.resilience.circuit_breaker.forge,
    ));

    let manifest = Arc::new(ManifestManager::load(config.manifest_path(project_dir)).await?);

    let idempotency = IdempotencyGuard::new(config.active_pipelines_path(project_dir));
    idempotency.load_from_disk().await?;

    let dlq = Arc::new(DeadLetterQueue::new(
        config.dlq_path(project_dir),
        config.resilience.dlq.clone(),
        config.adapters.retry_interval_ms,
    ));
    for webhook_config in &config.adapters.webhooks {
        let adapter = Arc::new(WebhookAdapter::new(webhook_config)?);
        dlq.register_adapter(adapter.clone()).await;
        bus.on_all(Arc::new(DirectDeliveryHandler::new(adapter, dlq.clone()))).await;
    }

    let cleaner = Arc::new(BranchCleaner::new(repo_path.clone(), config.cleanup.keep_on_failure));

    let owner_repo = remote_url.as_deref().and_then(parse_owner_repo_from_url);
    let integrator =
        Arc::new(Integrator::new(repo_path, config.clone(), breakers.clone(), bus.clone(), github_token, owner_repo));

    let director =
        Arc::new(Director::new(config.clone(), bus.clone(), manifest.clone(), integrator.clone(), cleaner.clone()));

    crate::wiring::install(
        &bus,
        config,
        manifest.clone(),
        idempotency.clone(),
        cleaner.clone(),
        director.clone(),
        integrator.clone(),
    )
    .await;

    Ok(Stack { bus, manifest, idempotency, dlq, cleaner, integrator, director })
}

pub async fn cmd_director(
    project_dir: PathBuf,
    repo_path: PathBuf,
    config: Config,
    github_token: Option<String>,
    remote_url: Option<String>,
) -> Result<()> {
    let config = Arc::new(config);
    let stack = build_stack(&project_dir, repo_path, config.clone(), github_token, remote_url).await?;

    let _dlq_task = stack.dlq.clone().spawn_retry_loop();
    let director_task = tokio::spawn(stack.director.clone().run_forever());

    tracing::info!("director running, schedule interval {}ms", config.director.schedule_interval_ms);
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down director");
    director_task.abort();
    Ok(())
}
