//! The closed set of pipeline/integration lifecycle events.
//!
//! Every event that crosses the [`EventBus`](../../branchline/src/events/bus.rs)
//! belongs to one of these kinds. The set is closed: new lifecycle signals
//! need a new variant here, not a free-form string.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // pipeline.*
    PipelineAccepted,
    PipelineStarted,
    PipelineContainersReady,
    PipelineTierClassified,
    PipelineAgentStarted,
    PipelineAgentCompleted,
    PipelineAgentFailed,
    PipelineCorrecting,
    PipelineCorrectionStarted,
    PipelineCorrectionCompleted,
    PipelineCompleted,
    PipelineFailed,
    PipelineStopped,
    PipelineMessage,
    PipelineCliMessage,

    // director.*
    DirectorActivated,
    DirectorIntegrationDispatched,
    DirectorIntegrationPrCreated,
    DirectorIntegrationFailed,
    DirectorPrRebaseNeeded,
    DirectorCycleCompleted,

    // integration.*
    IntegrationStarted,
    IntegrationConflictDetected,
    IntegrationConflictResolved,
    IntegrationPrCreated,
    IntegrationCompleted,
    IntegrationFailed,
    IntegrationPrMerged,
    IntegrationPrRebased,
    IntegrationPrRebaseFailed,

    // cleanup.*
    CleanupStarted,
    CleanupCompleted,
}

impl EventKind {
    /// The dotted, stringly-identified name this event kind is known by on
    /// the wire (journal lines, webhook payloads, logs).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PipelineAccepted => "pipeline.accepted",
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineContainersReady => "pipeline.containers.ready",
            Self::PipelineTierClassified => "pipeline.tier_classified",
            Self::PipelineAgentStarted => "pipeline.agent.started",
            Self::PipelineAgentCompleted => "pipeline.agent.completed",
            Self::PipelineAgentFailed => "pipeline.agent.failed",
            Self::PipelineCorrecting => "pipeline.correcting",
            Self::PipelineCorrectionStarted => "pipeline.correction.started",
            Self::PipelineCorrectionCompleted => "pipeline.correction.completed",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::PipelineStopped => "pipeline.stopped",
            Self::PipelineMessage => "pipeline.message",
            Self::PipelineCliMessage => "pipeline.cli_message",
            Self::DirectorActivated => "director.activated",
            Self::DirectorIntegrationDispatched => "director.integration.dispatched",
            Self::DirectorIntegrationPrCreated => "director.integration.pr_created",
            Self::DirectorIntegrationFailed => "director.integration.failed",
            Self::DirectorPrRebaseNeeded => "director.pr.rebase_needed",
            Self::DirectorCycleCompleted => "director.cycle.completed",
            Self::IntegrationStarted => "integration.started",
            Self::IntegrationConflictDetected => "integration.conflict.detected",
            Self::IntegrationConflictResolved => "integration.conflict.resolved",
            Self::IntegrationPrCreated => "integration.pr.created",
            Self::IntegrationCompleted => "integration.completed",
            Self::IntegrationFailed => "integration.failed",
            Self::IntegrationPrMerged => "integration.pr.merged",
            Self::IntegrationPrRebased => "integration.pr.rebased",
            Self::IntegrationPrRebaseFailed => "integration.pr.rebase_failed",
            Self::CleanupStarted => "cleanup.started",
            Self::CleanupCompleted => "cleanup.completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pipeline.accepted" => Self::PipelineAccepted,
            "pipeline.started" => Self::PipelineStarted,
            "pipeline.containers.ready" => Self::PipelineContainersReady,
            "pipeline.tier_classified" => Self::PipelineTierClassified,
            "pipeline.agent.started" => Self::PipelineAgentStarted,
            "pipeline.agent.completed" => Self::PipelineAgentCompleted,
            "pipeline.agent.failed" => Self::PipelineAgentFailed,
            "pipeline.correcting" => Self::PipelineCorrecting,
            "pipeline.correction.started" => Self::PipelineCorrectionStarted,
            "pipeline.correction.completed" => Self::PipelineCorrectionCompleted,
            "pipeline.completed" => Self::PipelineCompleted,
            "pipeline.failed" => Self::PipelineFailed,
            "pipeline.stopped" => Self::PipelineStopped,
            "pipeline.message" => Self::PipelineMessage,
            "pipeline.cli_message" => Self::PipelineCliMessage,
            "director.activated" => Self::DirectorActivated,
            "director.integration.dispatched" => Self::DirectorIntegrationDispatched,
            "director.integration.pr_created" => Self::DirectorIntegrationPrCreated,
            "director.integration.failed" => Self::DirectorIntegrationFailed,
            "director.pr.rebase_needed" => Self::DirectorPrRebaseNeeded,
            "director.cycle.completed" => Self::DirectorCycleCompleted,
            "integration.started" => Self::IntegrationStarted,
            "integration.conflict.detected" => Self::IntegrationConflictDetected,
            "integration.conflict.resolved" => Self::IntegrationConflictResolved,
            "integration.pr.created" => Self::IntegrationPrCreated,
            "integration.completed" => Self::IntegrationCompleted,
            "integration.failed" => Self::IntegrationFailed,
            "integration.pr.merged" => Self::IntegrationPrMerged,
            "integration.pr.rebased" => Self::IntegrationPrRebased,
            "integration.pr.rebase_failed" => Self::IntegrationPrRebaseFailed,
            "cleanup.started" => Self::CleanupStarted,
            "cleanup.completed" => Self::CleanupCompleted,
            other => return Err(format!("unknown event kind: {other}")),
        })
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable, published lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventKind,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    pub fn new(
        event_type: EventKind,
        request_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            timestamp: chrono::Utc::now(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_strings_are_dotted_and_snake() {
        assert_eq!(EventKind::PipelineTierClassified.as_str(), "pipeline.tier_classified");
        assert_eq!(EventKind::DirectorPrRebaseNeeded.as_str(), "director.pr.rebase_needed");
        assert_eq!(EventKind::IntegrationPrRebaseFailed.as_str(), "integration.pr.rebase_failed");
    }

    #[test]
    fn event_serializes_event_type_as_dotted_string() {
        let event = Event::new(
            EventKind::PipelineCompleted,
            "r1",
            serde_json::json!({"branch": "feature/login"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "pipeline.completed");
    }

    #[test]
    fn event_kind_round_trips_through_json() {
        for kind in [
            EventKind::PipelineAccepted,
            EventKind::DirectorPrRebaseNeeded,
            EventKind::IntegrationPrRebaseFailed,
            EventKind::CleanupCompleted,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: EventKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
