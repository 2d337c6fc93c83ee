//! Terminal progress feedback for long-running CLI commands.
//!
//! A spinner line reporting a pipeline run's lifecycle events as they are
//! published, the way the teacher's `ui/progress.rs` reports phase and
//! iteration progress — styled with `console::style`, rendered with
//! `indicatif`, driven by the EventBus rather than manual polling.

use std::sync::Arc;
use std::time::Duration;

use branchline_common::{Event, EventKind};
use console::{Emoji, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::events::EventBus;

static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "* ");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");

/// Spinner tracking one `branchline run` invocation end to end. Subscribes
/// itself to `bus` as a wildcard handler; events for other request ids are
/// ignored so a single bus can back several concurrent spinners.
pub struct RunSpinner {
    bar: ProgressBar,
}

impl RunSpinner {
    pub async fn attach(bus: &EventBus, request_id: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message(format!("{SPARKLE}{}", style("accepted").dim()));

        let bar_for_handler = bar.clone();
        let request_id_owned = request_id.to_string();
        bus.on_all(Arc::new(move |event: Event| {
            let bar = bar_for_handler.clone();
            let request_id = request_id_owned.clone();
            async move {
                if event.request_id == request_id {
                    bar.set_message(describe(&event));
                }
                Ok(())
            }
        }))
        .await;

        Self { bar }
    }

    pub fn finish(&self, succeeded: bool, summary: &str) {
        if succeeded {
            self.bar.finish_with_message(format!("{CHECK}{}", style(summary).green()));
        } else {
            self.bar.finish_with_message(format!("{CROSS}{}", style(summary).red()));
        }
    }
}

fn describe(event: &Event) -> String {
    match event.event_type {
        EventKind::PipelineTierClassified => "classifying change tier".to_string(),
        EventKind::PipelineContainersReady => "sandbox ready".to_string(),
        EventKind::PipelineAgentStarted => {
            let agent = event.data.get("agent_name").and_then(|v| v.as_str()).unwrap_or("agent");
            format!("running {agent}")
        }
        EventKind::PipelineCorrecting => "applying correction".to_string(),
        EventKind::PipelineCompleted => "approved".to_string(),
        EventKind::PipelineFailed => "failed".to_string(),
        EventKind::PipelineStopped => "stopped".to_string(),
        _ => "working".to_string(),
    }
}
