//! DeadLetterQueue: one file per failed outbound delivery, retried on an
//! interval with exponential backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use branchline_common::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::DlqConfig;
use crate::fsutil::write_json_atomic;

/// An adapter whose deliveries the DLQ retries on failure. Implemented by
/// the webhook outbound adapter (`webhook::outbound::WebhookAdapter`).
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry_id: String,
    pub adapter_name: String,
    pub event: Event,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub dead: bool,
}

pub struct DeadLetterQueue {
    root: PathBuf,
    config: DlqConfig,
    retry_interval_ms: u64,
    adapters: Mutex<Vec<Arc<dyn OutboundAdapter>>>,
}

/// Escape colons in an adapter name so it can be used as a directory
/// component (e.g. `webhook:https://example.com`).
fn escape_adapter_name(name: &str) -> String {
    name.replace(':', "_")
}

impl DeadLetterQueue {
    /// `retry_interval_ms` is `adapters.retry_interval_ms` (§6): how often the
    /// retry sweep wakes, distinct from `dlq.base_delay_ms`'s per-entry backoff.
    pub fn new(root: PathBuf, config: DlqConfig, retry_interval_ms: u64) -> Self {
        Self { root, config, retry_interval_ms, adapters: Mutex::new(Vec::new()) }
    }

    pub async fn register_adapter(&self, adapter: Arc<dyn OutboundAdapter>) {
        self.adapters.lock().await.push(adapter);
    }

    fn entry_path(&self, adapter_name: &str, entry_id: &str) -> PathBuf {
        self.root.join(escape_adapter_name(adapter_name)).join(format!("{entry_id}.json"))
    }

    /// Enqueue a failed delivery for later retry.
    pub async fn enqueue(
        &self,
        adapter_name: &str,
        event: Event,
        error: impl std::fmt::Display,
    ) -> anyhow::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let entry_id = uuid::Uuid::new_v4().to_string();
        let entry = DlqEntry {
            entry_id: entry_id.clone(),
            adapter_name: adapter_name.to_string(),
            event,
            attempt: 0,
            next_attempt_at: Utc::now()
                + chrono::Duration::milliseconds(self.config.base_delay_ms as i64),
            last_error: Some(error.to_string()),
            dead: false,
        };
        let path = self.entry_path(adapter_name, &entry_id);
        write_json_atomic(&path, &entry).await?;
        Ok(())
    }

    /// Scan every non-dead entry and retry those whose `next_attempt_at` has
    /// passed. Called on a `tokio::time::interval` tick.
    pub async fn retry_due(&self) -> anyhow::Result<()> {
        let adapters = self.adapters.lock().await.clone();
        let mut paths = Vec::new();
        collect_entry_paths(&self.root, &mut paths).await;

        let now = Utc::now();
        for path in paths {
            let mut entry: DlqEntry = match read_entry(&path).await {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable DLQ entry");
                    continue;
                }
            };
            if entry.dead || entry.next_attempt_at > now {
                continue;
            }

            let adapter = adapters.iter().find(|a| a.name() == entry.adapter_name).cloned();
            let Some(adapter) = adapter else {
                tracing::warn!(adapter = entry.adapter_name, "no adapter registered for DLQ entry");
                continue;
            };

            match adapter.deliver(&entry.event).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove delivered DLQ entry");
                    }
                }
                Err(e) => {
                    entry.attempt += 1;
                    entry.last_error = Some(e.to_string());
                    if entry.attempt >= self.config.max_retries {
                        entry.dead = true;
                        tracing::error!(
                            adapter = entry.adapter_name,
                            entry_id = entry.entry_id,
                            "DLQ entry exhausted retries, marking dead"
                        );
                    } else {
                        let backoff = self.config.base_delay_ms as f64
                            * self.config.backoff_factor.powi(entry.attempt as i32);
                        entry.next_attempt_at =
                            Utc::now() + chrono::Duration::milliseconds(backoff as i64);
                    }
                    if let Err(write_err) = write_json_atomic(&path, &entry).await {
                        tracing::error!(error = %write_err, "failed to persist DLQ retry state");
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn the interval-driven retry loop. Returns the task handle so the
    /// caller can abort it on shutdown.
    pub fn spawn_retry_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.retry_interval_ms.max(250);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                if let Err(e) = self.retry_due().await {
                    tracing::error!(error = %e, "DLQ retry sweep failed");
                }
            }
        })
    }
}

async fn collect_entry_paths(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(mut adapters) = tokio::fs::read_dir(root).await else { return };
    while let Ok(Some(adapter_dir)) = adapters.next_entry().await {
        if !adapter_dir.path().is_dir() {
            continue;
        }
        let Ok(mut entries) = tokio::fs::read_dir(adapter_dir.path()).await else { continue };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
    }
}

async fn read_entry(path: &Path) -> anyhow::Result<DlqEntry> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchline_common::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn config() -> DlqConfig {
        DlqConfig { enabled: true, path: PathBuf::new(), max_retries: 2, base_delay_ms: 0, backoff_factor: 2.0 }
    }

    fn sample_event() -> Event {
        Event::new(EventKind::PipelineCompleted, "r1", serde_json::json!({}))
    }

    struct FlakyAdapter {
        fail_times: StdArc<AtomicUsize>,
        attempts: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl OutboundAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "webhook:test"
        }

        async fn deliver(&self, _event: &Event) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("simulated delivery failure")
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_then_retry_succeeds_and_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().to_path_buf(), config(), 50);
        let attempts = StdArc::new(AtomicUsize::new(0));
        dlq.register_adapter(Arc::new(FlakyAdapter {
            fail_times: StdArc::new(AtomicUsize::new(0)),
            attempts: attempts.clone(),
        }))
        .await;

        dlq.enqueue("webhook:test", sample_event(), "boom").await.unwrap();
        dlq.retry_due().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let mut paths = Vec::new();
        collect_entry_paths(dir.path(), &mut paths).await;
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn exhausting_retries_marks_entry_dead() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().to_path_buf(), config(), 50);
        let attempts = StdArc::new(AtomicUsize::new(0));
        dlq.register_adapter(Arc::new(FlakyAdapter {
            fail_times: StdArc::new(AtomicUsize::new(10)),
            attempts: attempts.clone(),
        }))
        .await;

        dlq.enqueue("webhook:test", sample_event(), "boom").await.unwrap();
        dlq.retry_due().await.unwrap();
        dlq.retry_due().await.unwrap();

        let mut paths = Vec::new();
        collect_entry_paths(dir.path(), &mut paths).await;
        assert_eq!(paths.len(), 1);
        let entry = read_entry(&paths[0]).await.unwrap();
        assert!(entry.dead);
    }
}
