//! Per-request data: the inbound `PipelineRequest` and the in-memory
//! `PipelineState` the runner maintains while executing it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tier::Tier;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRequestConfig {
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub request_id: String,
    pub branch: String,
    pub worktree_path: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub config: PipelineRequestConfig,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// The pipeline run's finite lifecycle state machine.
///
/// Allowed transitions:
/// `accepted -> running`, `running <-> correcting`,
/// `{running, correcting} -> {approved, failed, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Accepted,
    Running,
    Correcting,
    Approved,
    Failed,
    Error,
}

impl PipelineStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Failed | Self::Error)
    }

    /// Whether `self -> next` is one of the state machine's allowed edges.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, next),
            (Accepted, Running)
                | (Running, Correcting)
                | (Correcting, Running)
                | (Running, Approved)
                | (Running, Failed)
                | (Running, Error)
                | (Correcting, Approved)
                | (Correcting, Failed)
                | (Correcting, Error)
        )
    }
}

/// Per-request record the runner owns exclusively while it is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub request_id: String,
    pub status: PipelineStatus,
    #[serde(default)]
    pub tier: Option<Tier>,
    pub pipeline_branch: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub request: PipelineRequest,
    #[serde(default)]
    pub events_count: u64,
    #[serde(default)]
    pub corrections_count: u64,
    #[serde(default)]
    pub corrections_applied: Vec<String>,
    /// Names of agents dispatched via a `Task`/`dispatch_agent` tool_use,
    /// in dispatch order. Feeds the PR body's per-agent table (§6).
    #[serde(default)]
    pub agents_dispatched: Vec<String>,
}

impl PipelineState {
    pub fn new(request: PipelineRequest, pipeline_branch: String) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status: PipelineStatus::Accepted,
            tier: None,
            pipeline_branch,
            started_at: chrono::Utc::now(),
            completed_at: None,
            request,
            events_count: 0,
            corrections_count: 0,
            corrections_applied: Vec::new(),
            agents_dispatched: Vec::new(),
        }
    }

    /// Attempt the transition. Invalid transitions are *not* rejected: the
    /// spec requires the status field to be force-written regardless so
    /// downstream consumers are never blocked on a stuck state, while the
    /// caller is told whether the edge was one of the allowed ones (to log
    /// an "invalid transition" diagnostic).
    pub fn transition(&mut self, next: PipelineStatus) -> bool {
        let valid = self.status.can_transition_to(next);
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(chrono::Utc::now());
        }
        valid
    }
}

/// `{branch -> request_id}` persisted by the idempotency guard.
pub type ActivePipelines = HashMap<String, String>;
