//! Durable priority work queue with retry, backoff, and dead-lettering.
//!
//! The queue is the sole source of "what to do next". Every mutation is
//! journaled before the call returns, so a crash mid-processing never loses
//! or duplicates an item; on restart the ready set is re-derived from status
//! and the dependency graph. Access is serialized through one mutex — two
//! dispatchers can never dequeue the same item.
//!
//! The journal is an append-only JSONL file of versioned item snapshots
//! (last record per id wins on replay). A malformed or unknown-version
//! record halts startup with [`EngineError::StateCorruption`] — persisted
//! state is never silently auto-repaired.

use crate::api::RetryConfig;
use crate::error::EngineError;
use crate::feedback::StructuralCheck;
use crate::fresh_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Journal format version. Bumped on incompatible record changes.
const JOURNAL_VERSION: u32 = 1;

// ── Priority & status ──────────────────────────────────────────────

/// Scheduling priority. Ordering is scheduling order: `Critical` beats
/// `High` beats `Medium` beats `Low`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// The priority for work escalated out of an exhausted retry loop:
    /// one tier up, and never below `High` — deferred remediation must not
    /// starve behind routine work.
    pub fn escalated(&self) -> Priority {
        match self {
            Priority::Low | Priority::Medium => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(EngineError::Validation(format!(
                "invalid priority '{other}' (expected low|medium|high|critical)"
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{label}")
    }
}

/// Lifecycle status of a work item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Assigned => "assigned",
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

// ── Work items ─────────────────────────────────────────────────────

/// One unit of orchestrated work.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkItem {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub status: WorkStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub project: String,
    /// Ids that must all be `Completed` before this item is ready.
    pub depends_on: Vec<String>,
    pub last_error: Option<String>,
    /// Earliest instant this item may be dequeued (backoff gate).
    pub not_before: Option<DateTime<Utc>>,
    /// Pointer to the captured lesson when this item dead-letters.
    pub lesson_ref: Option<String>,
    /// Structural verification plan evaluated by the feedback loop.
    #[serde(default)]
    pub verify: Vec<StructuralCheck>,
    /// Monotonic insertion sequence — stable FIFO tie-break within a tier.
    pub seq: u64,
}

/// Parameters for a new item. Only the description is required.
#[derive(Debug, Clone)]
pub struct WorkSpec {
    pub description: String,
    pub priority: Priority,
    pub project: String,
    pub depends_on: Vec<String>,
    pub max_retries: u32,
    pub verify: Vec<StructuralCheck>,
}

impl WorkSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: Priority::Medium,
            project: "default".into(),
            depends_on: Vec::new(),
            max_retries: 3,
            verify: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_check(mut self, check: StructuralCheck) -> Self {
        self.verify.push(check);
        self
    }
}

/// Result of [`WorkQueue::ack_failure`].
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The item went back to `Pending` and becomes ready after `delay`.
    Requeued { delay: Duration },
    /// Retries exhausted — the item is permanently `Failed`.
    DeadLettered,
}

/// Per-status item counts, for the `status` surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ── Journal record ─────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
struct JournalRecord {
    v: u32,
    item: WorkItem,
}

// ── WorkQueue ──────────────────────────────────────────────────────

struct QueueInner {
    items: HashMap<String, WorkItem>,
    journal: File,
    next_seq: u64,
}

/// The durable priority queue.
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    /// Backoff for failed attempts: `base * 2^retry_count`.
    backoff: RetryConfig,
    /// Jittered backoff for resource contention (no retry budget consumed).
    contention_backoff: RetryConfig,
    path: PathBuf,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("path", &self.path).finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Open (or create) a queue backed by the journal at `path`, replaying
    /// any existing records.
    ///
    /// Items found `Assigned` or `Running` were in flight at crash time and
    /// were never acked — they revert to `Pending`. The reversion is a pure
    /// function of the journal, so it is re-derived on every open rather
    /// than written back.
    pub fn open(path: impl Into<PathBuf>, backoff: RetryConfig) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StateCorruption(format!("cannot create queue dir: {e}"))
            })?;
        }

        let mut items = Self::replay(&path)?;
        let next_seq = items.values().map(|i| i.seq + 1).max().unwrap_or(0);

        for item in items.values_mut() {
            if matches!(item.status, WorkStatus::Assigned | WorkStatus::Running) {
                item.status = WorkStatus::Pending;
                info!("recovered in-flight item {} back to pending", item.id);
            }
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::StateCorruption(format!("cannot open journal: {e}")))?;

        Ok(Self {
            inner: Mutex::new(QueueInner {
                items,
                journal,
                next_seq,
            }),
            notify: Notify::new(),
            backoff,
            contention_backoff: RetryConfig::with_base(Duration::from_secs(2)).jittered(),
            path,
        })
    }

    /// Read-only view of the journal at `path`, oldest first. For status
    /// surfaces that must not touch a running driver's state.
    pub fn load_snapshot(path: &Path) -> Result<Vec<WorkItem>, EngineError> {
        let items = Self::replay(path)?;
        let mut items: Vec<WorkItem> = items.into_values().collect();
        items.sort_by_key(|i| (i.created_at, i.seq));
        Ok(items)
    }

    /// Path of the backing journal.
    pub fn journal_path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<HashMap<String, WorkItem>, EngineError> {
        let mut items = HashMap::new();
        if !path.exists() {
            return Ok(items);
        }

        let file = File::open(path)
            .map_err(|e| EngineError::StateCorruption(format!("cannot read journal: {e}")))?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| EngineError::StateCorruption(format!("journal read failed: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                EngineError::StateCorruption(format!(
                    "malformed journal record at line {}: {e}",
                    lineno + 1
                ))
            })?;
            if record.v != JOURNAL_VERSION {
                return Err(EngineError::StateCorruption(format!(
                    "unsupported journal version {} at line {}",
                    record.v,
                    lineno + 1
                )));
            }
            items.insert(record.item.id.clone(), record.item);
        }
        debug!("replayed {} item(s) from {}", items.len(), path.display());
        Ok(items)
    }

    /// Append one item snapshot and sync it to disk. Durability before
    /// acknowledgement: the caller's mutation has not happened until this
    /// returns.
    fn append(journal: &mut File, item: &WorkItem) -> Result<(), EngineError> {
        let record = JournalRecord {
            v: JOURNAL_VERSION,
            item: item.clone(),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| EngineError::StateCorruption(format!("journal encode failed: {e}")))?;
        line.push('\n');
        journal
            .write_all(line.as_bytes())
            .and_then(|()| journal.sync_data())
            .map_err(|e| EngineError::StateCorruption(format!("journal write failed: {e}")))
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Add a new item. Fails with a validation error on an empty description
    /// or a dependency reference to an unknown item.
    pub fn enqueue(&self, spec: WorkSpec) -> Result<String, EngineError> {
        if spec.description.trim().is_empty() {
            return Err(EngineError::Validation("empty work description".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        for dep in &spec.depends_on {
            if !inner.items.contains_key(dep) {
                return Err(EngineError::Validation(format!(
                    "dependency reference to unknown item '{dep}'"
                )));
            }
        }

        let item = WorkItem {
            id: fresh_id("wk"),
            description: spec.description,
            priority: spec.priority,
            status: WorkStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries,
            created_at: Utc::now(),
            project: spec.project,
            depends_on: spec.depends_on,
            last_error: None,
            not_before: None,
            lesson_ref: None,
            verify: spec.verify,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;

        Self::append(&mut inner.journal, &item)?;
        let id = item.id.clone();
        debug!("enqueued {id} ({}, {})", item.priority, item.project);
        inner.items.insert(id.clone(), item);
        drop(inner);

        self.notify.notify_waiters();
        Ok(id)
    }

    /// Pop the highest-priority, oldest-created ready item, transitioning it
    /// to `Assigned`. Returns `None` when nothing is ready.
    pub fn dequeue_next(&self) -> Result<Option<WorkItem>, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let ready_id = inner
            .items
            .values()
            .filter(|item| Self::is_ready(item, &inner.items, now))
            .min_by_key(|item| (std::cmp::Reverse(item.priority), item.created_at, item.seq))
            .map(|item| item.id.clone());

        let Some(id) = ready_id else {
            return Ok(None);
        };

        let mut item = inner.items.get(&id).cloned().expect("ready id present");
        item.status = WorkStatus::Assigned;
        Self::append(&mut inner.journal, &item)?;
        inner.items.insert(id, item.clone());
        debug!("dequeued {} ({})", item.id, item.priority);
        Ok(Some(item))
    }

    fn is_ready(item: &WorkItem, items: &HashMap<String, WorkItem>, now: DateTime<Utc>) -> bool {
        item.status == WorkStatus::Pending
            && item.not_before.is_none_or(|t| t <= now)
            && item.depends_on.iter().all(|dep| {
                items
                    .get(dep)
                    .is_some_and(|d| d.status == WorkStatus::Completed)
            })
    }

    /// Transition an `Assigned` item to `Running` as its cycle begins.
    pub fn mark_running(&self, id: &str) -> Result<(), EngineError> {
        self.transition(id, WorkStatus::Running, &[WorkStatus::Assigned], |_| {})
    }

    /// Acknowledge successful completion. Dependents of this item may now be
    /// ready, so waiters are notified.
    pub fn ack_success(&self, id: &str) -> Result<(), EngineError> {
        self.transition(id, WorkStatus::Completed, &[WorkStatus::Running], |item| {
            item.last_error = None;
        })?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Acknowledge a failed cycle. Within budget the item is requeued behind
    /// an exponential backoff gate; past it the item dead-letters.
    pub fn ack_failure(&self, id: &str, error: &str) -> Result<AckOutcome, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner
            .items
            .get(id)
            .ok_or_else(|| EngineError::Validation(format!("unknown item '{id}'")))?;

        if !matches!(item.status, WorkStatus::Assigned | WorkStatus::Running) {
            return Err(EngineError::Validation(format!(
                "cannot fail item '{id}' in status {}",
                item.status
            )));
        }

        let mut item = item.clone();
        item.last_error = Some(error.to_string());

        let outcome = if item.retry_count < item.max_retries {
            let delay = self.backoff.delay_for_attempt(item.retry_count);
            item.retry_count += 1;
            item.status = WorkStatus::Pending;
            item.not_before = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
            debug!(
                "requeued {id} (attempt {}/{}, ready in {:.1}s)",
                item.retry_count,
                item.max_retries,
                delay.as_secs_f64()
            );
            AckOutcome::Requeued { delay }
        } else {
            item.status = WorkStatus::Failed;
            warn!("dead-lettered {id} after {} retries: {error}", item.max_retries);
            AckOutcome::DeadLettered
        };

        Self::append(&mut inner.journal, &item)?;
        inner.items.insert(id.to_string(), item);
        Ok(outcome)
    }

    /// Dead-letter an item whose feedback loop exhausted its inline
    /// attempts. The loop's attempts consumed the retry budget, so the item
    /// reports `Failed` with its last error immediately — the loop has
    /// already converted the failure into deferred follow-up work.
    pub fn ack_exhausted(&self, id: &str, error: &str) -> Result<(), EngineError> {
        self.transition(
            id,
            WorkStatus::Failed,
            &[WorkStatus::Assigned, WorkStatus::Running],
            |item| {
                item.last_error = Some(error.to_string());
                item.retry_count = item.max_retries;
            },
        )
    }

    /// Requeue an item whose declared shared resource was unavailable.
    /// Jittered delay, retry budget untouched — the work was never attempted.
    pub fn requeue_contended(&self, id: &str, reason: &str) -> Result<Duration, EngineError> {
        let delay = self.contention_backoff.delay_for_attempt(0);
        self.transition(
            id,
            WorkStatus::Pending,
            &[WorkStatus::Assigned, WorkStatus::Running],
            |item| {
                item.last_error = Some(reason.to_string());
                item.not_before = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(2)),
                );
            },
        )?;
        Ok(delay)
    }

    /// Cancel a still-pending item. Archived, never deleted.
    pub fn cancel(&self, id: &str) -> Result<(), EngineError> {
        self.transition(id, WorkStatus::Cancelled, &[WorkStatus::Pending], |_| {})
    }

    /// Record the lesson captured when this item's loop exhausted.
    pub fn attach_lesson(&self, id: &str, lesson_ref: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner
            .items
            .get_mut(id)
            .ok_or_else(|| EngineError::Validation(format!("unknown item '{id}'")))?;
        item.lesson_ref = Some(lesson_ref.to_string());
        let item = item.clone();
        Self::append(&mut inner.journal, &item)
    }

    fn transition(
        &self,
        id: &str,
        to: WorkStatus,
        from: &[WorkStatus],
        mutate: impl FnOnce(&mut WorkItem),
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner
            .items
            .get(id)
            .ok_or_else(|| EngineError::Validation(format!("unknown item '{id}'")))?;

        if !from.contains(&item.status) {
            return Err(EngineError::Validation(format!(
                "invalid transition for '{id}': {} -> {to}",
                item.status
            )));
        }

        let mut item = item.clone();
        item.status = to;
        mutate(&mut item);
        Self::append(&mut inner.journal, &item)?;
        inner.items.insert(id.to_string(), item);
        Ok(())
    }

    // ── Read surface ───────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.inner.lock().unwrap().items.get(id).cloned()
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock().unwrap();
        let mut counts = QueueCounts::default();
        for item in inner.items.values() {
            match item.status {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::Assigned => counts.assigned += 1,
                WorkStatus::Running => counts.running += 1,
                WorkStatus::Completed => counts.completed += 1,
                WorkStatus::Failed => counts.failed += 1,
                WorkStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// All items, oldest first. For the status surface and tests.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let inner = self.inner.lock().unwrap();
        let mut items: Vec<WorkItem> = inner.items.values().cloned().collect();
        items.sort_by_key(|i| (i.created_at, i.seq));
        items
    }

    /// Whether any item is ready to dequeue right now.
    pub fn has_ready(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner
            .items
            .values()
            .any(|item| Self::is_ready(item, &inner.items, now))
    }

    /// Earliest backoff gate among pending items, for the driver's timer.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Pending)
            .filter_map(|i| i.not_before)
            .min()
    }

    /// Wait until something is enqueued or completed (which may unblock
    /// dependents). Used by the driver's wake condition.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}
