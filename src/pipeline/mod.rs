//! PipelineRunner: accepts a request, classifies its tier, runs the agent
//! inside an (optionally sandboxed) worktree, translates its message stream
//! into lifecycle events, and drives the request to a terminal state.
//!
//! Directly generalizes `factory/pipeline.rs::PipelineRunner` (there: one
//! issue -> one Claude subprocess -> one git branch -> one PR) into the
//! richer per-request state machine of §4.5, with the agent spawn/stream
//! pattern lifted from `orchestrator/runner.rs::run_iteration` and
//! `swarm/executor.rs::run_claude_process`.

pub mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use branchline_common::{
    Event, EventKind, PipelineError, PipelineRequest, PipelineState, PipelineStatus, Tier,
};
use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::events::EventBus;
use crate::resilience::circuit_breaker::CircuitBreakers;
use crate::sandbox::DockerSandbox;
use crate::tier as tier_classification;

use stream::Translator;

/// Per-request bookkeeping the runner keeps alive only for the duration of
/// `run()`: a stop signal `stop()` can notify, per Design Note 2's "owned
/// translator struct per request_id, dropped on the terminal event".
struct RunHandle {
    stop: Arc<Notify>,
}

pub struct PipelineRunner {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakers>,
    sandbox: Option<Arc<DockerSandbox>>,
    running: Mutex<HashMap<String, RunHandle>>,
}

impl PipelineRunner {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        breakers: Arc<CircuitBreakers>,
        sandbox: Option<Arc<DockerSandbox>>,
    ) -> Self {
        Self { config, bus, breakers, sandbox, running: Mutex::new(HashMap::new()) }
    }

    /// §4.5.6: terminate the agent subprocess gracefully. Ignored once a
    /// result has already been observed (the request is no longer running).
    pub async fn stop(&self, request_id: &str) {
        let running = self.running.lock().await;
        if let Some(handle) = running.get(request_id) {
            handle.stop.notify_one();
        }
    }

    /// Execute `request` end to end per §4.5.2. Returns the final state;
    /// errors here are infrastructure failures the caller should log — the
    /// pipeline's own failure is always reported via a terminal event, not
    /// a returned `Err`.
    pub async fn run(&self, request: PipelineRequest) -> anyhow::Result<PipelineState> {
        if request.branch.starts_with(&self.config.branch.pipeline_prefix) {
            anyhow::bail!(PipelineError::Validation(format!(
                "branch {} uses the reserved pipeline prefix {}",
                request.branch, self.config.branch.pipeline_prefix
            )));
        }

        let pipeline_branch = format!("{}{}", self.config.branch.pipeline_prefix, request.branch);
        let request_id = request.request_id.clone();
        let mut state = PipelineState::new(request.clone(), pipeline_branch.clone());

        let stop = Arc::new(Notify::new());
        self.running.lock().await.insert(request_id.clone(), RunHandle { stop: stop.clone() });

        self.publish(&mut state, Event::new(EventKind::PipelineAccepted, &request_id, serde_json::json!({
            "branch": request.branch,
            "pipeline_branch": pipeline_branch,
        })))
        .await;

        let result = self.run_inner(&mut state, &request, &pipeline_branch, stop).await;
        self.running.lock().await.remove(&request_id);

        if let Err(e) = result {
            if !state.status.is_terminal() {
                state.transition(PipelineStatus::Error);
                let event = self
                    .enrich_terminal(&state, Event::new(
                        EventKind::PipelineFailed,
                        &request_id,
                        serde_json::json!({"error": e.to_string()}),
                    ))
                    .with_metadata(request.metadata.clone().unwrap_or(serde_json::json!({})));
                self.publish(&mut state, event).await;
            }
        }

        Ok(state)
    }

    async fn run_inner(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        pipeline_branch: &str,
        stop: Arc<Notify>,
    ) -> anyhow::Result<()> {
        let base_branch = request.base_branch.clone().unwrap_or_else(|| self.config.branch.main.clone());
        let worktree_path = PathBuf::from(&request.worktree_path);

        let thresholds = tier_classification::thresholds_from_config(&self.config.tiers);
        let stats = tier_classification::compute_change_stats(&worktree_path, &base_branch)
            .unwrap_or_default();
        let tier = tier_classification::classify(stats, &thresholds, request.config.tier);
        state.tier = Some(tier);
        state.transition(PipelineStatus::Running);

        let event = Event::new(
            EventKind::PipelineTierClassified,
            &state.request_id,
            serde_json::json!({"tier": tier, "files_changed": stats.files_changed, "lines_changed": stats.lines_changed}),
        );
        self.publish(state, event).await;

        let sandboxed = match &self.sandbox {
            Some(sandbox) => sandbox.is_available().await,
            None => false,
        };
        if sandboxed {
            let event = Event::new(
                EventKind::PipelineContainersReady,
                &state.request_id,
                serde_json::json!({"sandboxed": sandboxed}),
            );
            self.publish(state, event).await;
        }

        let agents = tier_classification::agents_for_tier(&self.config.tiers, tier);
        let prompt = build_prompt(request, tier, agents, self.config.auto_correction.max_attempts, pipeline_branch);

        let claude_cmd = self.config.claude_cmd.clone();
        let skip_permissions = self.config.skip_permissions;
        let worktree_path_for_spawn = worktree_path.clone();
        let spawn_result = self
            .breakers
            .agent
            .call(async move {
                crate::agent::spawn(&claude_cmd, &worktree_path_for_spawn, &prompt, skip_permissions)
                    .await
                    .map_err(PipelineError::Other)
            })
            .await;

        let mut spawned = match spawn_result {
            Ok(spawned) => spawned,
            Err(e) => {
                state.transition(PipelineStatus::Error);
                let event = self.enrich_terminal(
                    state,
                    Event::new(EventKind::PipelineFailed, &state.request_id, serde_json::json!({"error": e.to_string()})),
                );
                self.publish(state, event).await;
                return Ok(());
            }
        };

        let mut translator = Translator::new(state.request_id.clone());
        let mut observed_terminal = false;

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    if !observed_terminal {
                        let _ = spawned.child.kill().await;
                        state.transition(PipelineStatus::Failed);
                        let event = self.enrich_terminal(
                            state,
                            Event::new(EventKind::PipelineStopped, &state.request_id, serde_json::json!({})),
                        );
                        self.publish(state, event).await;
                        observed_terminal = true;
                    }
                    break;
                }
                maybe_line = spawned.lines.recv() => {
                    let Some(line) = maybe_line else { break };
                    let translated = translator.translate_line(&line);
                    for mut event in translated.events {
                        state.events_count += 1;
                        match event.event_type {
                            EventKind::PipelineCorrecting => {
                                state.transition(PipelineStatus::Correcting);
                                state.corrections_count = translator.corrections_count() as u64;
                                if let Some(text) = event.data.get("text").and_then(|v| v.as_str()) {
                                    state.corrections_applied.push(text.to_string());
                                }
                            }
                            EventKind::PipelineAgentStarted => {
                                if let Some(name) = event.data.get("agent_name").and_then(|v| v.as_str()) {
                                    state.agents_dispatched.push(name.to_string());
                                }
                                if state.status == PipelineStatus::Correcting {
                                    state.transition(PipelineStatus::Running);
                                }
                            }
                            EventKind::PipelineCompleted => {
                                state.transition(PipelineStatus::Approved);
                                event = self.enrich_terminal(state, event);
                                observed_terminal = true;
                            }
                            EventKind::PipelineFailed => {
                                state.transition(PipelineStatus::Failed);
                                event = self.enrich_terminal(state, event);
                                observed_terminal = true;
                            }
                            _ => {}
                        }
                        self.publish(state, event).await;
                    }
                }
            }

            if observed_terminal {
                break;
            }
        }

        let _ = spawned.child.wait().await;

        if !observed_terminal {
            state.transition(PipelineStatus::Error);
            let event = self.enrich_terminal(
                state,
                Event::new(
                    EventKind::PipelineFailed,
                    &state.request_id,
                    serde_json::json!({"error": "Agent process exited unexpectedly"}),
                ),
            );
            self.publish(state, event).await;
        }

        Ok(())
    }

    /// §4.5.5: merge the enrichment fields into `event.data` and copy
    /// `state.request.metadata` into `event.metadata` before a terminal
    /// event is published.
    fn enrich_terminal(&self, state: &PipelineState, mut event: Event) -> Event {
        if let Some(object) = event.data.as_object_mut() {
            object.insert("branch".into(), serde_json::json!(state.request.branch));
            object.insert("pipeline_branch".into(), serde_json::json!(state.pipeline_branch));
            object.insert("worktree_path".into(), serde_json::json!(state.request.worktree_path));
            object.insert("base_branch".into(), serde_json::json!(state.request.base_branch));
            object.insert("tier".into(), serde_json::json!(state.tier));
            object.insert("corrections_applied".into(), serde_json::json!(state.corrections_applied));
            object.insert("agents_dispatched".into(), serde_json::json!(state.agents_dispatched));
        }
        if let Some(metadata) = state.request.metadata.clone() {
            event = event.with_metadata(metadata);
        }
        event
    }

    async fn publish(&self, state: &mut PipelineState, event: Event) {
        state.events_count += 1;
        self.bus.publish(event).await;
    }
}

fn build_prompt(
    request: &PipelineRequest,
    tier: Tier,
    agents: &[String],
    max_correction_attempts: u32,
    pipeline_branch: &str,
) -> String {
    format!(
        "You are working on branch `{pipeline_branch}` (tier: {tier}).\n\
         Agent roster for this tier: {}.\n\
         If any agent in the roster fails, you may re-run it up to {max_correction_attempts} times \
         as a correction cycle before giving up.\n\
         Task: implement the requested change against `{}` (base `{}`).\n",
        agents.join(", "),
        request.branch,
        request.base_branch.as_deref().unwrap_or("main"),
    )
}
