//! Events and handlers for observing the engine.
//!
//! The driver and the feedback loop communicate with embedders through
//! [`EngineEvent`] variants covering the lifecycle of a work item — from
//! dequeue through verification to completion or dead-lettering. Callers
//! implement [`EventHandler`] to observe these for logging, dashboards,
//! or tests; [`LoggingHandler`] bridges to `tracing` and [`NoopHandler`]
//! is for fire-and-forget runs.

use tracing::{debug, info, warn};

/// Events emitted during orchestration.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A work item was dequeued and its loop is starting.
    ItemStarted { item_id: &'a str, attempt_budget: u32 },
    /// One gather→act→verify cycle is starting.
    CycleStarted { item_id: &'a str, attempt: u32 },
    /// GATHER found the desired state already applied; ACT was skipped.
    ActSkipped { item_id: &'a str },
    /// VERIFY finished for one attempt.
    Verified {
        item_id: &'a str,
        attempt: u32,
        passed: bool,
        visual_confidence: Option<f64>,
    },
    /// Lessons from past failures were injected into the next attempt.
    LessonsInjected { item_id: &'a str, count: usize },
    /// A multi-attempt recovery was captured as a reusable pattern.
    RecoveryCaptured { item_id: &'a str, entry_id: &'a str },
    /// All attempts failed; a lesson and a deferred follow-up were created.
    Exhausted {
        item_id: &'a str,
        lesson_id: &'a str,
        follow_up_id: &'a str,
    },
    /// The item completed and was acked.
    ItemCompleted { item_id: &'a str, attempts: u32 },
    /// The item was requeued with a backoff delay.
    ItemRequeued { item_id: &'a str, delay_secs: f64 },
    /// The item permanently exhausted its retry budget.
    ItemDeadLettered { item_id: &'a str, error: &'a str },
    /// The driver found nothing ready and is waiting for work.
    Idle,
    /// The driver is stopping gracefully.
    Stopping,
}

/// Observer for engine events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>);
}

/// Handler that ignores all events.
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn on_event(&self, _event: &EngineEvent<'_>) {}
}

/// Handler that logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::ItemStarted {
                item_id,
                attempt_budget,
            } => info!("starting {item_id} (up to {attempt_budget} attempts)"),
            EngineEvent::CycleStarted { item_id, attempt } => {
                debug!("{item_id}: attempt {attempt}")
            }
            EngineEvent::ActSkipped { item_id } => {
                info!("{item_id}: desired state already applied, act skipped")
            }
            EngineEvent::Verified {
                item_id,
                attempt,
                passed,
                visual_confidence,
            } => match visual_confidence {
                Some(c) => debug!(
                    "{item_id}: attempt {attempt} verify passed={passed} (visual {c:.2})"
                ),
                None => debug!("{item_id}: attempt {attempt} verify passed={passed}"),
            },
            EngineEvent::LessonsInjected { item_id, count } => {
                debug!("{item_id}: injected {count} lesson(s) from past failures")
            }
            EngineEvent::RecoveryCaptured { item_id, entry_id } => {
                info!("{item_id}: recovery pattern captured as {entry_id}")
            }
            EngineEvent::Exhausted {
                item_id,
                lesson_id,
                follow_up_id,
            } => warn!("{item_id}: exhausted — lesson {lesson_id}, follow-up {follow_up_id}"),
            EngineEvent::ItemCompleted { item_id, attempts } => {
                info!("{item_id}: completed after {attempts} attempt(s)")
            }
            EngineEvent::ItemRequeued {
                item_id,
                delay_secs,
            } => info!("{item_id}: requeued, ready in {delay_secs:.1}s"),
            EngineEvent::ItemDeadLettered { item_id, error } => {
                warn!("{item_id}: dead-lettered: {error}")
            }
            EngineEvent::Idle => debug!("idle — waiting for work"),
            EngineEvent::Stopping => info!("stopping gracefully"),
        }
    }
}
