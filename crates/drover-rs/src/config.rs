//! Engine configuration.
//!
//! One [`OrchestratorConfig`] owns every tunable: where state lives on disk,
//! how wide the subagent pool is, the context budget handed to each loop,
//! and the nested feedback/backoff settings. Construct with
//! [`OrchestratorConfig::new`] and override with `with_*` methods; the
//! defaults are meant to be production-usable.

use crate::api::RetryConfig;
use crate::context::CompactorConfig;
use crate::coordinator::DEFAULT_MAX_CONCURRENT;
use crate::feedback::FeedbackConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root directory for all persisted state (queue journal, knowledge
    /// files, run transcripts, stop marker).
    pub data_dir: PathBuf,
    /// Default project scope for items enqueued without one.
    pub project: String,
    /// Subagent pool width.
    pub max_concurrent_subagents: usize,
    /// Work items the driver processes concurrently. One suspended loop must
    /// not block other independent items.
    pub max_concurrent_items: usize,
    /// Context window parameters for each loop instance.
    pub compactor: CompactorConfig,
    /// Feedback loop tunables.
    pub feedback: FeedbackConfig,
    /// Queue requeue backoff (`base * 2^retry_count`).
    pub queue_backoff: RetryConfig,
    /// Upper bound on idle sleep between driver wake-ups.
    pub max_idle_wait: Duration,
}

impl OrchestratorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            project: "default".into(),
            max_concurrent_subagents: DEFAULT_MAX_CONCURRENT,
            max_concurrent_items: 2,
            compactor: CompactorConfig::default(),
            feedback: FeedbackConfig::default(),
            queue_backoff: RetryConfig::with_base(Duration::from_secs(5)),
            max_idle_wait: Duration::from_secs(30),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_max_concurrent_subagents(mut self, max: usize) -> Self {
        self.max_concurrent_subagents = max.max(1);
        self
    }

    pub fn with_max_concurrent_items(mut self, max: usize) -> Self {
        self.max_concurrent_items = max.max(1);
        self
    }

    pub fn with_context_budget(mut self, tokens: usize) -> Self {
        self.compactor.budget_tokens = tokens;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_queue_backoff(mut self, backoff: RetryConfig) -> Self {
        self.queue_backoff = backoff;
        self
    }

    // ── Derived paths ──────────────────────────────────────────────

    pub fn queue_journal_path(&self) -> PathBuf {
        self.data_dir.join("queue").join("journal.jsonl")
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.data_dir.join("knowledge")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    pub fn stop_marker_path(&self) -> PathBuf {
        self.data_dir.join("stop")
    }

    /// Whether a graceful-stop marker is present.
    pub fn stop_requested(&self) -> bool {
        self.stop_marker_path().exists()
    }

    /// Remove a consumed stop marker.
    pub fn clear_stop_marker(&self) {
        let _ = std::fs::remove_file(self.stop_marker_path());
    }
}

/// Write a stop marker into `data_dir`, asking a running driver to finish
/// in-flight cycles, persist, and exit.
pub fn request_stop(data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(data_dir.join("stop"), b"stop\n")
}
