//! The driver tick loop tying the engine together.
//!
//! One [`Orchestrator`] owns the work queue, the knowledge store handle, and
//! the subagent coordinator — constructed once and passed by reference, no
//! process-wide singletons. Each tick: pop the highest-priority ready item,
//! prefetch relevant lessons into a fresh context window, run the feedback
//! loop (fanning into subagents where the model delegates), persist the
//! outcome to the knowledge store and transcript, and acknowledge the queue.
//!
//! The driver never busy-polls: between ticks it sleeps on explicit wake
//! conditions — the queue's "work arrived" signal, the earliest backoff
//! gate, a stop request — whichever fires first. A graceful stop finishes
//! the in-flight cycle, persists, and exits; `StateCorruption` found at
//! open halts startup and is surfaced for manual intervention.

use crate::api::ModelService;
use crate::config::OrchestratorConfig;
use crate::context::ContextWindow;
use crate::coordinator::SubagentCoordinator;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler, NoopHandler};
use crate::feedback::{FeedbackLoop, LoopOutcome};
use crate::knowledge::KnowledgeStore;
use crate::queue::{AckOutcome, QueueCounts, WorkItem, WorkQueue};
use crate::tools::CapabilitySet;
use crate::transcript::TranscriptWriter;
use crate::{Turn, TurnRole, fresh_id};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was ready.
    Idle,
    /// The item completed and was acked.
    Completed { item_id: String },
    /// The loop exhausted; the item dead-lettered and follow-up work exists.
    Exhausted { item_id: String, follow_up_id: String },
    /// A per-cycle failure; the item was requeued with backoff.
    Requeued { item_id: String },
    /// A per-cycle failure past the queue's retry budget; dead-lettered.
    DeadLettered { item_id: String },
    /// A declared shared resource was busy; requeued without spending budget.
    Contended { item_id: String },
}

/// Point-in-time status for the operational surface.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub run_id: String,
    pub counts: QueueCounts,
    pub knowledge_entries: usize,
    /// Dead-lettered items: id, last error, lesson pointer.
    pub dead_letters: Vec<(String, String, Option<String>)>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "run: {}", self.run_id)?;
        writeln!(
            f,
            "queue: {} pending, {} assigned, {} running, {} completed, {} failed, {} cancelled",
            self.counts.pending,
            self.counts.assigned,
            self.counts.running,
            self.counts.completed,
            self.counts.failed,
            self.counts.cancelled,
        )?;
        writeln!(f, "knowledge: {} entries", self.knowledge_entries)?;
        for (id, error, lesson) in &self.dead_letters {
            match lesson {
                Some(lesson) => writeln!(f, "dead-letter {id}: {error} (lesson {lesson})")?,
                None => writeln!(f, "dead-letter {id}: {error}")?,
            }
        }
        Ok(())
    }
}

/// The engine: queue, knowledge, coordinator, and the driver loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<WorkQueue>,
    knowledge: Arc<KnowledgeStore>,
    coordinator: Arc<SubagentCoordinator>,
    model: Arc<dyn ModelService>,
    caps: Arc<CapabilitySet>,
    handler: Box<dyn EventHandler>,
    transcript: TranscriptWriter,
    run_id: String,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("run_id", &self.run_id).finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Open the engine: replay the queue journal, load the knowledge store,
    /// start a fresh run transcript. Inconsistent persisted state surfaces
    /// here as [`EngineError::StateCorruption`] and halts startup.
    pub fn open(
        config: OrchestratorConfig,
        model: Arc<dyn ModelService>,
        caps: Arc<CapabilitySet>,
    ) -> Result<Self, EngineError> {
        let queue = Arc::new(WorkQueue::open(
            config.queue_journal_path(),
            config.queue_backoff.clone(),
        )?);
        let knowledge = Arc::new(KnowledgeStore::open(config.knowledge_dir())?);
        let coordinator = Arc::new(SubagentCoordinator::new(
            Arc::clone(&model),
            Arc::clone(&caps),
            config.max_concurrent_subagents,
        ));

        let run_id = fresh_id("run");
        let transcript = TranscriptWriter::create(&config.runs_dir(), &run_id)?;

        // A marker left over from a previous shutdown must not stop this run
        // before it starts.
        config.clear_stop_marker();

        info!("engine open (run {run_id})");
        Ok(Self {
            config,
            queue,
            knowledge,
            coordinator,
            model,
            caps,
            handler: Box::new(NoopHandler),
            transcript,
            run_id,
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    pub fn with_event_handler(mut self, handler: Box<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn coordinator(&self) -> &Arc<SubagentCoordinator> {
        &self.coordinator
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Process at most one ready item.
    pub async fn tick(&self) -> Result<TickOutcome, EngineError> {
        let Some(item) = self.queue.dequeue_next()? else {
            return Ok(TickOutcome::Idle);
        };

        self.handler.on_event(&EngineEvent::ItemStarted {
            item_id: &item.id,
            attempt_budget: self.config.feedback.max_attempts,
        });
        self.transcript.append(
            TurnRole::User,
            format!("work item {} ({}): {}", item.id, item.priority, item.description),
        )?;
        self.queue.mark_running(&item.id)?;

        let mut window = self.prepare_window(&item)?;
        let feedback = FeedbackLoop::new(
            Arc::clone(&self.model),
            Arc::clone(&self.caps),
            Arc::clone(&self.knowledge),
            Arc::clone(&self.queue),
            self.config.feedback.clone(),
        )
        .with_coordinator(Arc::clone(&self.coordinator))
        .with_event_handler(self.handler.as_ref());

        match feedback.drive(&item, &mut window).await {
            Ok(report) => {
                for cycle in &report.cycles {
                    self.transcript.append(
                        TurnRole::Assistant,
                        format!("attempt {}: {}", cycle.attempt, cycle.action_taken),
                    )?;
                    self.transcript.append(
                        TurnRole::Tool,
                        format!(
                            "verify passed={} failed=[{}]",
                            cycle.outcome.passed,
                            cycle.outcome.failed_checks.join(", ")
                        ),
                    )?;
                }

                match report.outcome {
                    LoopOutcome::Completed { attempts, .. } => {
                        self.queue.ack_success(&item.id)?;
                        self.handler.on_event(&EngineEvent::ItemCompleted {
                            item_id: &item.id,
                            attempts,
                        });
                        self.transcript.append(
                            TurnRole::Assistant,
                            format!("completed after {attempts} attempt(s)"),
                        )?;
                        Ok(TickOutcome::Completed { item_id: item.id })
                    }
                    LoopOutcome::Exhausted {
                        lesson_ref,
                        follow_up_id,
                        last_error,
                    } => {
                        // The loop consumed the retry budget inline and has
                        // already turned the failure into deferred work.
                        self.queue.attach_lesson(&item.id, &lesson_ref)?;
                        self.queue.ack_exhausted(&item.id, &last_error)?;
                        self.handler.on_event(&EngineEvent::ItemDeadLettered {
                            item_id: &item.id,
                            error: &last_error,
                        });
                        self.transcript.append(
                            TurnRole::Assistant,
                            format!(
                                "exhausted: {last_error} (lesson {lesson_ref}, follow-up {follow_up_id})"
                            ),
                        )?;
                        Ok(TickOutcome::Exhausted {
                            item_id: item.id,
                            follow_up_id,
                        })
                    }
                }
            }
            Err(EngineError::ResourceContention(reason)) => {
                let delay = self.queue.requeue_contended(&item.id, &reason)?;
                self.handler.on_event(&EngineEvent::ItemRequeued {
                    item_id: &item.id,
                    delay_secs: delay.as_secs_f64(),
                });
                self.transcript
                    .append(TurnRole::Assistant, format!("contended: {reason}"))?;
                Ok(TickOutcome::Contended { item_id: item.id })
            }
            Err(err @ EngineError::StateCorruption(_)) => Err(err),
            Err(EngineError::Validation(msg)) => {
                // Fatal for this item: surfaced, never retried.
                self.queue.ack_exhausted(&item.id, &msg)?;
                self.handler.on_event(&EngineEvent::ItemDeadLettered {
                    item_id: &item.id,
                    error: &msg,
                });
                self.transcript
                    .append(TurnRole::Assistant, format!("fatal: {msg}"))?;
                Ok(TickOutcome::DeadLettered { item_id: item.id })
            }
            Err(err) => {
                // Per-cycle failure (e.g. context overflow): spend one unit
                // of the queue's retry budget and let backoff decide when a
                // fresh window gets another try.
                let msg = err.to_string();
                let outcome = self.queue.ack_failure(&item.id, &msg)?;
                self.transcript
                    .append(TurnRole::Assistant, format!("cycle failed: {msg}"))?;
                match outcome {
                    AckOutcome::Requeued { delay } => {
                        self.handler.on_event(&EngineEvent::ItemRequeued {
                            item_id: &item.id,
                            delay_secs: delay.as_secs_f64(),
                        });
                        Ok(TickOutcome::Requeued { item_id: item.id })
                    }
                    AckOutcome::DeadLettered => {
                        self.handler.on_event(&EngineEvent::ItemDeadLettered {
                            item_id: &item.id,
                            error: &msg,
                        });
                        Ok(TickOutcome::DeadLettered { item_id: item.id })
                    }
                }
            }
        }
    }

    /// Fresh window for one item: pinned system framing, the task, and the
    /// most relevant lessons prefetched from the knowledge store — sealed as
    /// the cache-stable prefix before the loop starts.
    fn prepare_window(&self, item: &WorkItem) -> Result<ContextWindow, EngineError> {
        let mut window = ContextWindow::new(self.config.compactor.clone());
        window.push(Turn::pinned(
            TurnRole::System,
            "You drive one work item of an autonomous orchestration engine. \
             Perform the step with the available tools, then reply with a \
             short summary and stop.",
        ))?;
        window.push(Turn::pinned(
            TurnRole::User,
            format!(
                "Work item {} (project {}): {}",
                item.id, item.project, item.description
            ),
        ))?;

        let keywords: Vec<&str> = item.description.split_whitespace().collect();
        let lessons = self.knowledge.search(
            &keywords,
            Some(item.project.as_str()),
            self.config.feedback.lesson_limit,
        );
        for lesson in &lessons {
            window.push(Turn::pinned(
                TurnRole::User,
                format!(
                    "Relevant prior knowledge ({}): {} — {}",
                    lesson.entry.kind, lesson.entry.title, lesson.entry.content
                ),
            ))?;
        }
        window.seal_prefix();
        Ok(window)
    }

    // ── Driver loop ────────────────────────────────────────────────

    /// Run ticks until a stop is requested, processing up to
    /// `max_concurrent_items` items at once — one suspended loop never
    /// blocks other ready work. A graceful stop finishes every in-flight
    /// cycle before exiting; between ticks the driver sleeps on explicit
    /// wake conditions, never a polling interval.
    pub async fn run(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut inflight: tokio::task::JoinSet<Result<TickOutcome, EngineError>> =
            tokio::task::JoinSet::new();

        loop {
            if self.stop.load(Ordering::SeqCst) || self.config.stop_requested() {
                while let Some(joined) = inflight.join_next().await {
                    self.handle_tick_result(joined)?;
                }
                self.handler.on_event(&EngineEvent::Stopping);
                self.transcript
                    .append(TurnRole::Assistant, "graceful stop")?;
                self.config.clear_stop_marker();
                return Ok(());
            }

            // Fill the pool while ready work exists. A tick that loses the
            // dequeue race reports Idle and costs nothing.
            while inflight.len() < self.config.max_concurrent_items && self.queue.has_ready() {
                let engine = Arc::clone(self);
                inflight.spawn(async move { engine.tick().await });
            }

            if inflight.is_empty() {
                self.handler.on_event(&EngineEvent::Idle);
                self.wait_for_wake().await;
            } else {
                tokio::select! {
                    joined = inflight.join_next() => {
                        if let Some(joined) = joined {
                            self.handle_tick_result(joined)?;
                        }
                    }
                    _ = self.wait_for_wake() => {}
                }
            }
        }
    }

    /// Fold one finished tick into the driver: corruption halts, everything
    /// else is logged and survived.
    fn handle_tick_result(
        &self,
        joined: Result<Result<TickOutcome, EngineError>, tokio::task::JoinError>,
    ) -> Result<(), EngineError> {
        match joined {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if err.is_fatal_corruption() => Err(err),
            Ok(Err(err)) => {
                warn!("tick failed: {err}");
                Ok(())
            }
            Err(e) => {
                warn!("tick panicked: {e}");
                Ok(())
            }
        }
    }

    /// Sleep until work arrives, the earliest backoff gate opens, a stop is
    /// requested, or the idle cap elapses — whichever comes first.
    async fn wait_for_wake(&self) {
        let until_ready = self
            .queue
            .next_ready_at()
            .and_then(|at| (at - chrono::Utc::now()).to_std().ok())
            .unwrap_or(self.config.max_idle_wait);
        let wait = until_ready.min(self.config.max_idle_wait).max(Duration::from_millis(10));

        tokio::select! {
            _ = self.queue.wait_for_work() => {}
            _ = self.stop_notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Request a graceful stop: the in-flight cycle finishes, state is
    /// already persisted, the driver exits.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    /// Current status for the operational surface.
    pub fn status(&self) -> StatusReport {
        let dead_letters = self
            .queue
            .snapshot()
            .into_iter()
            .filter(|i| i.status == crate::queue::WorkStatus::Failed)
            .map(|i| {
                (
                    i.id,
                    i.last_error.unwrap_or_else(|| "unknown".into()),
                    i.lesson_ref,
                )
            })
            .collect();

        StatusReport {
            run_id: self.run_id.clone(),
            counts: self.queue.counts(),
            knowledge_entries: self.knowledge.len(),
            dead_letters,
        }
    }
}
