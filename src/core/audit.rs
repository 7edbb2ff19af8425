//! Append-only audit trail for every routed request.
//!
//! Entries are pushed onto a bounded in-memory queue and persisted by a
//! dedicated writer task, keeping durable-log I/O off the request path. When
//! the queue is full the oldest entry is dropped and an overrun counter
//! incremented; the producer never blocks. Files rotate daily and are pruned
//! past the configured retention window.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::core::config::{AuditConfig, PricingConfig};
use crate::core::metrics;

/// Terminal outcome of a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    RateLimited,
    CircuitOpen,
    UpstreamError,
    Timeout,
    Cancelled,
}

/// One immutable record per completed request. Never references live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Correlation id linking this entry to request logs
    pub correlation_id: String,
    /// Caller identity from the client certificate or API key
    pub caller: String,
    /// Provider that produced the terminal outcome
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Estimated cost in USD, when pricing is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub outcome: AuditOutcome,
    /// Sanitized error description for failed requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Estimate the cost of a completed call from configured per-1M-token rates.
pub fn estimate_cost(
    pricing: Option<&PricingConfig>,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> Option<f64> {
    pricing.map(|p| {
        (f64::from(prompt_tokens) * p.input_cost_per_1m
            + f64::from(completion_tokens) * p.output_cost_per_1m)
            / 1_000_000.0
    })
}

#[derive(Debug)]
struct AuditQueue {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    capacity: usize,
    notify: Notify,
}

impl AuditQueue {
    fn push(&self, entry: AuditLogEntry) {
        {
            let mut entries = self.entries.lock().expect("audit queue mutex poisoned");
            if entries.len() >= self.capacity {
                // Overrun: availability over completeness
                entries.pop_front();
                if let Some(m) = metrics::try_get_metrics() {
                    m.audit_overruns.inc();
                }
                tracing::warn!("Audit queue full, dropped oldest entry");
            }
            entries.push_back(entry);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<AuditLogEntry> {
        let mut entries = self.entries.lock().expect("audit queue mutex poisoned");
        entries.drain(..).collect()
    }
}

/// Handle used by the request path to record entries.
///
/// Cloning is cheap; all clones share the same queue and writer task.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    queue: Arc<AuditQueue>,
}

impl AuditLogger {
    /// Create the logger and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: &AuditConfig) -> Self {
        let logger = Self::detached(config.queue_size);
        let queue = logger.queue.clone();
        let dir = config.dir.clone();
        let retention_days = config.retention_days;
        tokio::spawn(async move {
            writer_loop(queue, dir, retention_days).await;
        });
        logger
    }

    /// Create a logger with no writer task. Entries stay queued; used by
    /// tests and by callers that drain the queue themselves.
    pub fn detached(queue_size: usize) -> Self {
        Self {
            queue: Arc::new(AuditQueue {
                entries: Mutex::new(VecDeque::new()),
                capacity: queue_size.max(1),
                notify: Notify::new(),
            }),
        }
    }

    /// Record one entry. Non-blocking; drops the oldest queued entry on
    /// overflow.
    pub fn record(&self, entry: AuditLogEntry) {
        self.queue.push(entry);
    }

    /// Remove and return all queued entries.
    pub fn drain(&self) -> Vec<AuditLogEntry> {
        self.queue.drain()
    }

    /// Number of queued, not-yet-persisted entries.
    pub fn pending(&self) -> usize {
        self.queue
            .entries
            .lock()
            .expect("audit queue mutex poisoned")
            .len()
    }
}

/// Name of the audit file for a given date.
fn file_name_for(date: NaiveDate) -> String {
    format!("audit-{}.jsonl", date.format("%Y-%m-%d"))
}

/// Parse the date out of a rotated file name, if it is one of ours.
fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let date_part = name.strip_prefix("audit-")?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

async fn writer_loop(queue: Arc<AuditQueue>, dir: PathBuf, retention_days: u32) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::error!(error = %e, dir = %dir.display(), "Failed to create audit log directory");
        return;
    }

    let mut current_date = Utc::now().date_naive();
    prune_old_files(&dir, current_date, retention_days).await;

    loop {
        queue.notify.notified().await;
        let batch = queue.drain();
        if batch.is_empty() {
            continue;
        }

        let today = Utc::now().date_naive();
        if today != current_date {
            current_date = today;
            prune_old_files(&dir, current_date, retention_days).await;
        }

        if let Err(e) = append_batch(&dir.join(file_name_for(current_date)), &batch).await {
            tracing::error!(error = %e, "Failed to write audit log batch");
        }
    }
}

async fn append_batch(path: &Path, batch: &[AuditLogEntry]) -> std::io::Result<()> {
    let mut buf = String::new();
    for entry in batch {
        match serde_json::to_string(entry) {
            Ok(line) => {
                buf.push_str(&line);
                buf.push('\n');
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize audit entry"),
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await
}

async fn prune_old_files(dir: &Path, today: NaiveDate, retention_days: u32) {
    let Ok(mut read_dir) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date) = date_from_file_name(name) else {
            continue;
        };
        let age = today.signed_duration_since(date).num_days();
        if age > i64::from(retention_days) {
            if let Err(e) = tokio::fs::remove_file(dir_entry.path()).await {
                tracing::warn!(error = %e, file = name, "Failed to prune audit file");
            } else {
                tracing::info!(file = name, "Pruned expired audit file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(correlation_id: &str) -> AuditLogEntry {
        AuditLogEntry {
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            caller: "alice".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            estimated_cost_usd: None,
            duration_ms: 123,
            outcome: AuditOutcome::Success,
            error: None,
        }
    }

    #[test]
    fn test_record_and_drain() {
        let logger = AuditLogger::detached(10);
        logger.record(entry("a"));
        logger.record(entry("b"));
        assert_eq!(logger.pending(), 2);

        let drained = logger.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].correlation_id, "a");
        assert_eq!(logger.pending(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let logger = AuditLogger::detached(2);
        logger.record(entry("a"));
        logger.record(entry("b"));
        logger.record(entry("c"));

        let drained = logger.drain();
        assert_eq!(drained.len(), 2);
        // "a" was the oldest and got dropped
        assert_eq!(drained[0].correlation_id, "b");
        assert_eq!(drained[1].correlation_id, "c");
    }

    #[test]
    fn test_entry_serialization_is_snake_case() {
        let mut e = entry("corr-1");
        e.outcome = AuditOutcome::CircuitOpen;
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"outcome\":\"circuit_open\""));
        assert!(json.contains("\"correlation_id\":\"corr-1\""));
        // None fields elided
        assert!(!json.contains("estimated_cost_usd"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_estimate_cost() {
        let pricing = PricingConfig {
            input_cost_per_1m: 1.0,
            output_cost_per_1m: 2.0,
        };
        let cost = estimate_cost(Some(&pricing), 1_000_000, 500_000).unwrap();
        assert!((cost - 2.0).abs() < 1e-9);
        assert_eq!(estimate_cost(None, 100, 100), None);
    }

    #[test]
    fn test_file_name_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 27).unwrap();
        let name = file_name_for(date);
        assert_eq!(name, "audit-2026-08-27.jsonl");
        assert_eq!(date_from_file_name(&name), Some(date));
        assert_eq!(date_from_file_name("audit.jsonl"), None);
        assert_eq!(date_from_file_name("other-2026-08-27.jsonl"), None);
    }

    #[tokio::test]
    async fn test_writer_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            dir: dir.path().to_path_buf(),
            queue_size: 100,
            retention_days: 7,
        };
        let logger = AuditLogger::spawn(&config);
        logger.record(entry("persisted-1"));
        logger.record(entry("persisted-2"));

        // Give the writer task a moment to flush
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let path = dir.path().join(file_name_for(Utc::now().date_naive()));
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.correlation_id, "persisted-1");
    }

    #[tokio::test]
    async fn test_prune_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("audit-2020-01-01.jsonl");
        let fresh = dir.path().join(file_name_for(Utc::now().date_naive()));
        let unrelated = dir.path().join("notes.txt");
        tokio::fs::write(&old, "x\n").await.unwrap();
        tokio::fs::write(&fresh, "y\n").await.unwrap();
        tokio::fs::write(&unrelated, "z\n").await.unwrap();

        prune_old_files(dir.path(), Utc::now().date_naive(), 30).await;

        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
