//! `branchline run` — submit one `PipelineRequest` and drive it to a
//! terminal state in-process, printing the final status. Generalizes
//! `cmd/run.rs::run_orchestrator`'s "build the full stack, execute,
//! report" shape down to a single pipeline rather than a sequential phase
//! list.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use branchline_common::{PipelineRequest, PipelineStatus};

use crate::config::Config;
use crate::events::EventBus;
use crate::idempotency::IdempotencyGuard;
use crate::pipeline::PipelineRunner;
use crate::resilience::circuit_breaker::CircuitBreakers;
use crate::sandbox::DockerSandbox;
use crate::ui::RunSpinner;

pub async fn cmd_run(project_dir: PathBuf, config: Config, request: PipelineRequest) -> Result<i32> {
    let config = Arc::new(config);
    let bus = Arc::new(EventBus::new(config.events_path(&project_dir)));
    let breakers = Arc::new(CircuitBreakers::new(
        &config.resilience.circuit_breaker.agent,
        &config.resilience.circuit_breaker.forge,
    ));
    let sandbox = DockerSandbox::new(config.sandbox_image.clone()).await.map(Arc::new);

    let idempotency = IdempotencyGuard::new(config.active_pipelines_path(&project_dir));
    idempotency.load_from_disk().await?;
    let check = idempotency.check(&request.branch);
    if check.is_duplicate {
        anyhow::bail!(
            "branch {} already has an active pipeline (request {})",
            request.branch,
            check.existing_request_id.unwrap_or_default()
        );
    }
    idempotency.register(request.branch.clone(), request.request_id.clone());

    let spinner = RunSpinner::attach(&bus, &request.request_id).await;

    let runner = PipelineRunner::new(config, bus.clone(), breakers, sandbox);
    let state = runner.run(request.clone()).await?;
    idempotency.release(&request.branch);
    drop(runner);

    spinner.finish(state.status == PipelineStatus::Approved, &format!("{:?}", state.status));

    if let Ok(bus) = Arc::try_unwrap(bus) {
        bus.shutdown().await;
    }

    println!(
        "{} {:?} (tier: {:?}, events: {}, corrections: {})",
        request.request_id, state.status, state.tier, state.events_count, state.corrections_count
    );

    Ok(match state.status {
        PipelineStatus::Approved => 0,
        _ => 1,
    })
}
