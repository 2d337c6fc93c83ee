//! The EventBus: typed pub/sub plus a non-blocking append-only journal.
//!
//! Generalizes `factory/ws.rs`'s `WsMessage` broadcast (there: push to
//! connected browser clients) into "push to in-process subscriber closures
//! registered by `EventKind`, or a wildcard". The journal write is fed
//! through an unbounded `mpsc` to a background task so `publish` never
//! blocks on disk IO, mirroring `orchestrator/state.rs::StateManager::save`'s
//! append idiom but off the hot path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use branchline_common::{Event, EventKind};
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, mpsc};

/// A registered subscriber. Handlers absorb their own errors into a `Result`
/// so one failing handler never prevents delivery to the rest.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    /// Used only in log lines when a handler errors.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Blanket impl so a plain async closure can be registered directly.
#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self)(event.clone()).await
    }
}

struct Registry {
    by_kind: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    wildcard: Vec<Arc<dyn EventHandler>>,
}

impl Registry {
    fn new() -> Self {
        Self { by_kind: HashMap::new(), wildcard: Vec::new() }
    }
}

pub struct EventBus {
    registry: RwLock<Registry>,
    journal_tx: mpsc::UnboundedSender<Event>,
    journal_task: tokio::task::JoinHandle<()>,
}

impl EventBus {
    /// Spawns the background journal-writer task. `journal_path`'s parent
    /// directory is created if missing.
    pub fn new(journal_path: PathBuf) -> Self {
        let (journal_tx, mut journal_rx) = mpsc::unbounded_channel::<Event>();
        let journal_task = tokio::spawn(async move {
            if let Some(parent) = journal_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(path = %journal_path.display(), error = %e, "failed to open event journal");
                    return;
                }
            };
            while let Some(event) = journal_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            tracing::error!(error = %e, "failed to append event to journal");
                            continue;
                        }
                        let _ = file.write_all(b"\n").await;
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize event for journal"),
                }
            }
            let _ = file.flush().await;
        });

        Self { registry: RwLock::new(Registry::new()), journal_tx, journal_task }
    }

    /// Register a handler for one event kind.
    pub async fn on(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.registry.write().await.by_kind.entry(kind).or_default().push(handler);
    }

    /// Register a handler invoked for every published event, regardless of kind.
    pub async fn on_all(&self, handler: Arc<dyn EventHandler>) {
        self.registry.write().await.wildcard.push(handler);
    }

    /// Fan the event to every matching subscriber (in publish order) and
    /// enqueue it for the journal. Returns once all handlers have run; the
    /// journal write itself happens asynchronously afterward.
    pub async fn publish(&self, event: Event) {
        if self.journal_tx.send(event.clone()).is_err() {
            tracing::error!("event journal writer task is gone, dropping journal line");
        }

        let registry = self.registry.read().await;
        for handler in registry.wildcard.iter().chain(
            registry.by_kind.get(&event.event_type).into_iter().flatten(),
        ) {
            if let Err(e) = handler.handle(&event).await {
                tracing::error!(
                    handler = handler.name(),
                    event_type = event.event_type.as_str(),
                    request_id = %event.request_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }

    /// Drop the sender and wait for the journal writer to drain and exit.
    /// Call during graceful shutdown.
    pub async fn shutdown(self) {
        drop(self.journal_tx);
        let _ = self.journal_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn sample_event(kind: EventKind) -> Event {
        Event::new(kind, "r1", serde_json::json!({"branch": "feature/login"}))
    }

    #[tokio::test]
    async fn delivers_to_matching_and_wildcard_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(dir.path().join("events.jsonl"));

        let specific_hits = StdArc::new(AtomicUsize::new(0));
        let wildcard_hits = StdArc::new(AtomicUsize::new(0));

        struct Counter(StdArc<AtomicUsize>);
        #[async_trait]
        impl EventHandler for Counter {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        bus.on(EventKind::PipelineCompleted, Arc::new(Counter(specific_hits.clone()))).await;
        bus.on_all(Arc::new(Counter(wildcard_hits.clone()))).await;

        bus.publish(sample_event(EventKind::PipelineCompleted)).await;
        bus.publish(sample_event(EventKind::PipelineFailed)).await;

        assert_eq!(specific_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(dir.path().join("events.jsonl"));
        let hits = StdArc::new(AtomicUsize::new(0));

        struct Failing;
        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                anyhow::bail!("boom")
            }
        }
        struct Counter(StdArc<AtomicUsize>);
        #[async_trait]
        impl EventHandler for Counter {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        bus.on(EventKind::PipelineFailed, Arc::new(Failing)).await;
        bus.on(EventKind::PipelineFailed, Arc::new(Counter(hits.clone()))).await;
        bus.publish(sample_event(EventKind::PipelineFailed)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn journal_contains_published_events() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("events.jsonl");
        let bus = EventBus::new(journal_path.clone());

        bus.publish(sample_event(EventKind::PipelineAccepted)).await;
        bus.publish(sample_event(EventKind::PipelineCompleted)).await;
        bus.shutdown().await;

        let contents = tokio::fs::read_to_string(&journal_path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "pipeline.accepted");
    }
}
