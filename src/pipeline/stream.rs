//! The agent message-stream contract and its translation into lifecycle events.
//!
//! Directly generalizes `stream/mod.rs::StreamEvent` (`system`/`assistant`/
//! `user`/`result` variants) into the closed discriminator table of the
//! agent wire protocol, and gives each in-flight request its own translator
//! struct — Design Note 2's "stateful per-request translator object", kept
//! as a plain owned value under the Runner's per-request state rather than
//! exposed to callers.

use branchline_common::{Event, EventKind};
use regex::RegexSet;
use serde::Deserialize;

/// Tool names the runner treats as "an agent was dispatched".
const DISPATCH_TOOL_NAMES: &[&str] = &["Task", "dispatch_agent"];

const CORRECTION_PATTERNS: &[&str] = &[
    r"(?i)correction\s+cycle",
    r"(?i)re-?runn?ing\s+(the\s+)?failing",
    r"(?i)applying\s+(the\s+)?fix",
    r"(?i)fix(ing|ed)\s+.*\bre-?run",
    r"(?i)agents?\s+(that\s+)?failed.*re-?run",
    r"(?i)\bcorrection\s+(round|attempt|pass)\b",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    User {
        #[serde(default)]
        message: serde_json::Value,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        errors: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Per-request translator state (Design Note 2). One instance lives per
/// `request_id` under the PipelineRunner's guarded map; dropped on the
/// terminal event.
pub struct Translator {
    request_id: String,
    agents_started: u32,
    in_correction_cycle: bool,
    corrections_count: u32,
    correction_patterns: RegexSet,
}

/// The outcome of translating one incoming stream message: the verbatim
/// forward plus zero or more derived lifecycle events, in emission order.
pub struct Translated {
    pub events: Vec<Event>,
}

impl Translator {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            agents_started: 0,
            in_correction_cycle: false,
            corrections_count: 0,
            correction_patterns: RegexSet::new(CORRECTION_PATTERNS)
                .expect("correction patterns are valid regular expressions"),
        }
    }

    pub fn corrections_count(&self) -> u32 {
        self.corrections_count
    }

    pub fn agents_started(&self) -> u32 {
        self.agents_started
    }

    /// Translate one raw NDJSON line. Unparseable lines still produce a
    /// `pipeline.cli_message` carrying the raw text so UIs can render them.
    pub fn translate_line(&mut self, raw_line: &str) -> Translated {
        let mut events = Vec::new();

        let parsed: Option<StreamMessage> = serde_json::from_str(raw_line).ok();
        let cli_payload = serde_json::from_str::<serde_json::Value>(raw_line)
            .unwrap_or_else(|_| serde_json::json!({"raw": raw_line}));
        events.push(Event::new(EventKind::PipelineCliMessage, &self.request_id, cli_payload));

        let Some(message) = parsed else { return Translated { events } };
        if let Some(event) = self.translate_message(&message) {
            events.push(event);
        }
        Translated { events }
    }

    fn translate_message(&mut self, message: &StreamMessage) -> Option<Event> {
        match message {
            StreamMessage::System { subtype, session_id, model } if subtype == "init" => {
                Some(Event::new(
                    EventKind::PipelineStarted,
                    &self.request_id,
                    serde_json::json!({"session_id": session_id, "model": model}),
                ))
            }
            StreamMessage::System { .. } => None,
            StreamMessage::Assistant { message } => self.translate_assistant(message),
            StreamMessage::User { .. } => None,
            StreamMessage::Result {
                subtype,
                result,
                is_error,
                duration_ms,
                num_turns,
                total_cost_usd,
                errors,
            } => {
                self.in_correction_cycle = false;
                if *is_error {
                    Some(Event::new(
                        EventKind::PipelineFailed,
                        &self.request_id,
                        serde_json::json!({
                            "errors": errors,
                            "result": result,
                            "duration_ms": duration_ms,
                            "cost_usd": total_cost_usd,
                            "corrections_count": self.corrections_count,
                        }),
                    ))
                } else {
                    Some(Event::new(
                        EventKind::PipelineCompleted,
                        &self.request_id,
                        serde_json::json!({
                            "subtype": subtype,
                            "result": result,
                            "duration_ms": duration_ms,
                            "num_turns": num_turns,
                            "cost_usd": total_cost_usd,
                            "corrections_count": self.corrections_count,
                        }),
                    ))
                }
            }
        }
    }

    fn translate_assistant(&mut self, message: &AssistantMessage) -> Option<Event> {
        let dispatch = message.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } if DISPATCH_TOOL_NAMES.contains(&name.as_str()) => {
                Some((id.clone(), name.clone(), input.clone()))
            }
            _ => None,
        });

        if let Some((tool_use_id, agent_name, input)) = dispatch {
            self.agents_started += 1;
            self.in_correction_cycle = false;
            return Some(Event::new(
                EventKind::PipelineAgentStarted,
                &self.request_id,
                serde_json::json!({"tool_use_id": tool_use_id, "agent_name": agent_name, "input": input}),
            ));
        }

        let text: String = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return None;
        }

        // No agent started yet, or already mid correction-cycle: no event.
        if self.agents_started == 0 || self.in_correction_cycle {
            return None;
        }

        if self.correction_patterns.is_match(&text) {
            self.corrections_count += 1;
            self.in_correction_cycle = true;
            return Some(Event::new(
                EventKind::PipelineCorrecting,
                &self.request_id,
                serde_json::json!({"correction_number": self.corrections_count, "text": text}),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(value: serde_json::Value) -> String {
        value.to_string()
    }

    #[test]
    fn system_init_produces_pipeline_started() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "system", "subtype": "init", "session_id": "s1", "model": "claude"
        })));
        assert_eq!(translated.events.len(), 2);
        assert_eq!(translated.events[1].event_type, EventKind::PipelineStarted);
    }

    #[test]
    fn tool_use_dispatch_produces_agent_started() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
        })));
        assert_eq!(translated.events[1].event_type, EventKind::PipelineAgentStarted);
        assert_eq!(t.agents_started(), 1);
    }

    #[test]
    fn correction_text_before_any_agent_start_produces_no_event() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Starting correction cycle 1"}]}
        })));
        assert_eq!(translated.events.len(), 1);
    }

    #[test]
    fn correction_text_after_agent_start_produces_correcting_event() {
        let mut t = Translator::new("r1");
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
        })));
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Starting correction cycle 1: re-running failing agents"}]}
        })));
        assert_eq!(translated.events[1].event_type, EventKind::PipelineCorrecting);
        assert_eq!(translated.events[1].data["correction_number"], 1);
        assert_eq!(t.corrections_count(), 1);
    }

    #[test]
    fn second_correction_match_while_in_cycle_produces_no_additional_event() {
        let mut t = Translator::new("r1");
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
        })));
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "correction cycle 1"}]}
        })));
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "correction cycle again"}]}
        })));
        assert_eq!(translated.events.len(), 1);
        assert_eq!(t.corrections_count(), 1);
    }

    #[test]
    fn agent_started_during_correction_cycle_clears_the_flag() {
        let mut t = Translator::new("r1");
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "tu1", "name": "Task", "input": {}}]}
        })));
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "correction cycle 1"}]}
        })));
        assert!(t.in_correction_cycle);
        t.translate_line(&line(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "tu2", "name": "Task", "input": {}}]}
        })));
        assert!(!t.in_correction_cycle);
    }

    #[test]
    fn result_success_produces_completed_and_resets_correction_cycle() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "result", "subtype": "success", "result": "ok", "is_error": false,
            "duration_ms": 100, "num_turns": 3, "total_cost_usd": 0.01
        })));
        assert_eq!(translated.events[1].event_type, EventKind::PipelineCompleted);
        assert!(!t.in_correction_cycle);
    }

    #[test]
    fn result_error_produces_failed() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line(&line(serde_json::json!({
            "type": "result", "is_error": true, "errors": ["boom"]
        })));
        assert_eq!(translated.events[1].event_type, EventKind::PipelineFailed);
    }

    #[test]
    fn unparseable_line_still_forwards_as_cli_message() {
        let mut t = Translator::new("r1");
        let translated = t.translate_line("not json at all");
        assert_eq!(translated.events.len(), 1);
        assert_eq!(translated.events[0].event_type, EventKind::PipelineCliMessage);
    }
}
