//! The gather→act→verify→retry state machine that drives one work item.
//!
//! Each attempt runs three phases:
//! - **GATHER** — capture a pre-action snapshot through the verification
//!   capabilities (structural checks, optional screenshot). If the desired
//!   state is already applied, the redundant ACT is skipped outright — the
//!   loop is safe to repeat.
//! - **ACT** — a bounded model/tool round loop over the item's context
//!   window, under a timeout. A timeout is a verify failure, never a hang.
//! - **VERIFY** — re-capture state and evaluate: deterministic structural
//!   checks are hard-required; the model-scored visual check is advisory by
//!   default (`require_visual` upgrades it).
//!
//! On failure the error is classified, the knowledge store is searched for
//! lessons from similar past failures (by error category), the most relevant
//! are injected into the next attempt's context, and the loop backs off and
//! retries. After `max_attempts` the loop transitions to EXHAUSTED: it
//! persists a lesson and enqueues a higher-priority follow-up item
//! referencing the original — a hard failure becomes deferred work instead
//! of blocking the driver. A success that needed more than one attempt is
//! captured as a recovery pattern so the next similar failure resolves
//! faster.

use crate::api::{ModelRequest, ModelService, RetryConfig};
use crate::context::ContextWindow;
use crate::coordinator::{SubagentCoordinator, SubagentSpec};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler, NoopHandler};
use crate::knowledge::{EntryKind, KnowledgeStore, NewEntry};
use crate::queue::{WorkItem, WorkQueue, WorkSpec};
use crate::tools::{CapabilitySet, SubagentRole};
use crate::{ToolContract, Turn, TurnRole, json_schema_for};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tool name for fanning parallel sub-steps into the coordinator.
pub const DELEGATE_TOOL: &str = "delegate_subagents";

// ── Verification plan ──────────────────────────────────────────────

/// A deterministic structural assertion evaluated through the capability
/// contracts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralCheck {
    FileExists { path: String },
    ProcessRunning { name: String },
    PortListening { port: u16 },
    CommandSucceeds { command: String },
}

impl StructuralCheck {
    /// Stable label used as the snapshot observation key.
    pub fn label(&self) -> String {
        match self {
            StructuralCheck::FileExists { path } => format!("file:{path}"),
            StructuralCheck::ProcessRunning { name } => format!("process:{name}"),
            StructuralCheck::PortListening { port } => format!("port:{port}"),
            StructuralCheck::CommandSucceeds { command } => format!("command:{command}"),
        }
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Tunables for one loop.
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Attempts before the loop transitions to EXHAUSTED.
    pub max_attempts: u32,
    /// Most-relevant lessons injected per failed attempt.
    pub lesson_limit: usize,
    /// Timeout on each ACT phase.
    pub act_timeout: Duration,
    /// Rounds of model/tool interaction within one ACT.
    pub act_max_rounds: u32,
    /// Per-response token budget for ACT model calls.
    pub act_token_budget: u32,
    /// Backoff between attempts.
    pub backoff: RetryConfig,
    /// Upgrade the visual check from advisory to hard-required.
    pub require_visual: bool,
    /// Minimum confidence for a hard-required visual check to pass.
    pub visual_confidence_floor: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lesson_limit: 3,
            act_timeout: Duration::from_secs(120),
            act_max_rounds: 6,
            act_token_budget: 4096,
            backoff: RetryConfig::with_base(Duration::from_millis(500)),
            require_visual: false,
            visual_confidence_floor: 0.7,
        }
    }
}

impl FeedbackConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_act_timeout(mut self, timeout: Duration) -> Self {
        self.act_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_require_visual(mut self, required: bool) -> Self {
        self.require_visual = required;
        self
    }
}

// ── Delegation arguments ───────────────────────────────────────────

/// One sub-step in a `delegate_subagents` call.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct DelegateTask {
    /// Subagent specialization. Read-only roles cannot mutate anything.
    pub role: SubagentRole,
    /// The sub-step to perform.
    pub instruction: String,
    /// Optional findings to hand the subagent so it doesn't re-discover them.
    #[serde(default)]
    pub context: Option<String>,
}

/// Arguments for the `delegate_subagents` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct DelegateArgs {
    pub tasks: Vec<DelegateTask>,
}

fn delegate_contract() -> ToolContract {
    ToolContract::new(
        DELEGATE_TOOL,
        "Run several independent sub-steps in parallel, each by an isolated \
         subagent with its own context. Roles: execution, verification, \
         file_ops, research, coordination. Results return in task order. \
         Parallelism is bounded; excess tasks queue.",
        json_schema_for::<DelegateArgs>(),
    )
}

// ── Snapshots & outcomes ───────────────────────────────────────────

/// Observed state at one instant: each structural check's label mapped to
/// whether it held, plus an optional visual capture.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub observations: BTreeMap<String, bool>,
    pub screenshot: Option<Vec<u8>>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn all_pass(&self) -> bool {
        self.observations.values().all(|&pass| pass)
    }

    pub fn failed_labels(&self) -> Vec<String> {
        self.observations
            .iter()
            .filter(|&(_, &pass)| !pass)
            .map(|(label, _)| label.clone())
            .collect()
    }
}

/// Result of one VERIFY phase.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub structural_passed: bool,
    pub visual_confidence: Option<f64>,
    pub passed: bool,
    pub failed_checks: Vec<String>,
}

/// The record of one full gather→act→verify attempt.
#[derive(Debug, Clone)]
pub struct FeedbackCycle {
    pub action_taken: String,
    pub pre: Snapshot,
    pub post: Snapshot,
    pub outcome: VerifyOutcome,
    pub attempt: u32,
    pub exhausted: bool,
}

/// Terminal state of one loop run.
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    /// Verification passed. `pattern_ref` is set when recovery took more
    /// than one attempt and was captured for reuse.
    Completed {
        attempts: u32,
        pattern_ref: Option<String>,
    },
    /// All attempts failed; a lesson was persisted and a follow-up enqueued.
    Exhausted {
        lesson_ref: String,
        follow_up_id: String,
        last_error: String,
    },
}

/// Everything a loop run produced.
#[derive(Debug)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub cycles: Vec<FeedbackCycle>,
}

// ── FeedbackLoop ───────────────────────────────────────────────────

/// Drives one work item to completion or exhaustion.
pub struct FeedbackLoop<'h> {
    model: Arc<dyn ModelService>,
    caps: Arc<CapabilitySet>,
    knowledge: Arc<KnowledgeStore>,
    queue: Arc<WorkQueue>,
    coordinator: Option<Arc<SubagentCoordinator>>,
    config: FeedbackConfig,
    handler: &'h dyn EventHandler,
}

impl<'h> FeedbackLoop<'h> {
    pub fn new(
        model: Arc<dyn ModelService>,
        caps: Arc<CapabilitySet>,
        knowledge: Arc<KnowledgeStore>,
        queue: Arc<WorkQueue>,
        config: FeedbackConfig,
    ) -> Self {
        Self {
            model,
            caps,
            knowledge,
            queue,
            coordinator: None,
            config,
            handler: &NoopHandler,
        }
    }

    /// Enable the `delegate_subagents` tool, letting ACT fan parallel
    /// sub-steps into the bounded coordinator pool.
    pub fn with_coordinator(mut self, coordinator: Arc<SubagentCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_event_handler(mut self, handler: &'h dyn EventHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Run the state machine for `item` over its exclusively-owned window.
    ///
    /// Retryable failures (transient backend, tool execution) stay inside the
    /// loop and consume attempts. Everything else propagates: validation
    /// errors are fatal, resource contention is requeued by the driver
    /// without touching the retry budget, and context overflow means the
    /// caller must summarize.
    pub async fn drive(
        &self,
        item: &WorkItem,
        window: &mut ContextWindow,
    ) -> Result<LoopReport, EngineError> {
        let mut cycles: Vec<FeedbackCycle> = Vec::new();
        let mut last_error = String::from("verification never passed");

        for attempt in 1..=self.config.max_attempts {
            self.handler.on_event(&EngineEvent::CycleStarted {
                item_id: &item.id,
                attempt,
            });

            // GATHER: pre-action snapshot.
            let pre = self.capture_snapshot(&item.verify).await;

            // Idempotency: if every configured check already holds, the step
            // was applied by a previous (possibly crashed) run — skip ACT.
            if !item.verify.is_empty() && pre.all_pass() {
                self.handler.on_event(&EngineEvent::ActSkipped { item_id: &item.id });
                let outcome = VerifyOutcome {
                    structural_passed: true,
                    visual_confidence: None,
                    passed: true,
                    failed_checks: Vec::new(),
                };
                cycles.push(FeedbackCycle {
                    action_taken: "skipped: desired state already applied".into(),
                    post: pre.clone(),
                    pre,
                    outcome,
                    attempt,
                    exhausted: false,
                });
                return Ok(LoopReport {
                    outcome: LoopOutcome::Completed {
                        attempts: attempt,
                        pattern_ref: None,
                    },
                    cycles,
                });
            }

            // ACT: model/tool rounds under a timeout.
            let act_result =
                match tokio::time::timeout(self.config.act_timeout, self.act(item, window)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::ToolExecution(format!(
                        "act timed out after {:.0}s",
                        self.config.act_timeout.as_secs_f64()
                    ))),
                };

            let (action_taken, act_error) = match act_result {
                Ok(action) => (action, None),
                Err(err) if err.consumes_retry_budget() => {
                    (format!("act failed: {err}"), Some(err))
                }
                // Fatal or specially-handled errors leave the loop.
                Err(err) => return Err(err),
            };

            // VERIFY: post-action snapshot plus advisory visual check.
            let post = self.capture_snapshot(&item.verify).await;
            let visual_confidence = if act_error.is_none() {
                self.visual_check(item, post.screenshot.as_deref()).await
            } else {
                None
            };
            let outcome = self.evaluate(&post, visual_confidence, act_error.as_ref());

            self.handler.on_event(&EngineEvent::Verified {
                item_id: &item.id,
                attempt,
                passed: outcome.passed,
                visual_confidence,
            });

            let passed = outcome.passed;
            if !passed {
                last_error = act_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| {
                        format!("verification failed: {}", outcome.failed_checks.join(", "))
                    });
            }

            cycles.push(FeedbackCycle {
                action_taken,
                pre,
                post,
                outcome,
                attempt,
                exhausted: false,
            });

            if passed {
                let pattern_ref = if attempt > 1 {
                    self.capture_recovery_pattern(item, attempt, &cycles)
                } else {
                    None
                };
                return Ok(LoopReport {
                    outcome: LoopOutcome::Completed {
                        attempts: attempt,
                        pattern_ref,
                    },
                    cycles,
                });
            }

            // Failure path: consult the knowledge store, inject lessons,
            // back off, retry.
            if attempt < self.config.max_attempts {
                let category = act_error
                    .as_ref()
                    .map(EngineError::category)
                    .unwrap_or("verification");
                self.inject_lessons(item, category, window)?;
                let delay = self.config.backoff.delay_for_attempt(attempt - 1);
                debug!("{}: backing off {:.1}s before retry", item.id, delay.as_secs_f64());
                tokio::time::sleep(delay).await;
            }
        }

        // EXHAUSTED: persist the lesson, enqueue deferred remediation.
        if let Some(cycle) = cycles.last_mut() {
            cycle.exhausted = true;
        }
        let (lesson_ref, follow_up_id) = self.escalate(item, &last_error)?;
        self.handler.on_event(&EngineEvent::Exhausted {
            item_id: &item.id,
            lesson_id: &lesson_ref,
            follow_up_id: &follow_up_id,
        });

        Ok(LoopReport {
            outcome: LoopOutcome::Exhausted {
                lesson_ref,
                follow_up_id,
                last_error,
            },
            cycles,
        })
    }

    // ── ACT ────────────────────────────────────────────────────────

    /// One ACT phase: bounded model/tool rounds over the shared window.
    /// Returns a short description of the action taken.
    ///
    /// Capability infrastructure failures abort the phase and feed the retry
    /// path; argument mistakes by the model are fed back as tool-result
    /// strings so it can correct itself within the phase.
    async fn act(&self, item: &WorkItem, window: &mut ContextWindow) -> Result<String, EngineError> {
        let mut contracts = self.caps.contracts();
        if self.coordinator.is_some() {
            contracts.push(delegate_contract());
        }
        let mut action = String::from("no action taken");

        for _round in 0..self.config.act_max_rounds {
            let request = ModelRequest {
                turns: window.turns().to_vec(),
                tool_contracts: contracts.clone(),
                token_budget: self.config.act_token_budget,
            };
            let response = self
                .model
                .complete(&request)
                .await
                .map_err(EngineError::from)?;

            if let Some(ref text) = response.text
                && !text.is_empty()
            {
                action = text.clone();
                window.push(Turn::reasoning(text.clone()))?;
            }

            if response.tool_calls.is_empty() {
                return Ok(action);
            }

            for call in &response.tool_calls {
                let result = if call.name == DELEGATE_TOOL {
                    self.delegate(item, &call.arguments).await
                } else {
                    match self.caps.dispatch(call).await {
                        Ok(result) => result,
                        Err(EngineError::Validation(msg)) => format!("Error: {msg}"),
                        Err(err) => return Err(err),
                    }
                };
                window.push(Turn::tool_result(result))?;
                action = format!("invoked {}", call.name);
            }
        }

        debug!("{}: act round limit reached", item.id);
        Ok(action)
    }

    /// Fan a batch of sub-steps into the coordinator. Results come back in
    /// task order; failures are reported inline, never propagated — one
    /// subagent cannot sink the whole attempt.
    async fn delegate(&self, item: &WorkItem, arguments: &str) -> String {
        let Some(ref coordinator) = self.coordinator else {
            return "Error: subagent delegation is not available".into();
        };
        let args: DelegateArgs = match serde_json::from_str(arguments) {
            Ok(args) => args,
            Err(e) => return format!("Error: invalid delegate_subagents arguments: {e}"),
        };
        if args.tasks.is_empty() {
            return "Error: delegate_subagents needs at least one task".into();
        }

        let specs: Vec<SubagentSpec> = args
            .tasks
            .into_iter()
            .map(|task| {
                let context = task
                    .context
                    .map(|c| vec![Turn::reasoning(c)])
                    .unwrap_or_default();
                SubagentSpec::new(task.role, task.instruction)
                    .with_context(context)
                    .with_parent(item.id.as_str())
            })
            .collect();

        let results = coordinator.run_batch(specs).await;
        results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "[task {} — {} {:?} in {} round(s)]\n{}",
                    i + 1,
                    r.role,
                    r.status,
                    r.rounds_used,
                    r.output
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    // ── VERIFY ─────────────────────────────────────────────────────

    /// Evaluate each structural check through the capability contracts.
    /// Capability errors observe as a failed check, never a panic.
    async fn capture_snapshot(&self, checks: &[StructuralCheck]) -> Snapshot {
        let mut observations = BTreeMap::new();
        for check in checks {
            let held = match self.evaluate_check(check).await {
                Ok(held) => held,
                Err(err) => {
                    warn!("check {} unobservable: {err}", check.label());
                    false
                }
            };
            observations.insert(check.label(), held);
        }

        let screenshot = match self.caps.gui() {
            Some(gui) => gui.screenshot().await.ok(),
            None => None,
        };

        Snapshot {
            observations,
            screenshot,
            taken_at: Utc::now(),
        }
    }

    async fn evaluate_check(&self, check: &StructuralCheck) -> Result<bool, EngineError> {
        match check {
            StructuralCheck::FileExists { path } => match self.caps.files() {
                Some(files) => Ok(files.read(path).await.is_ok()),
                None => Err(EngineError::ToolExecution(
                    "file capability not configured".into(),
                )),
            },
            StructuralCheck::ProcessRunning { name } => {
                let procs = match self.caps.process() {
                    Some(process) => process.list_processes().await?,
                    None => {
                        return Err(EngineError::ToolExecution(
                            "process capability not configured".into(),
                        ));
                    }
                };
                Ok(procs.iter().any(|p| p.contains(name.as_str())))
            }
            StructuralCheck::PortListening { port } => match self.caps.process() {
                Some(process) => process.port_listening(*port).await,
                None => Err(EngineError::ToolExecution(
                    "process capability not configured".into(),
                )),
            },
            StructuralCheck::CommandSucceeds { command } => match self.caps.shell() {
                Some(shell) => Ok(shell.run(command).await?.success()),
                None => Err(EngineError::ToolExecution(
                    "shell capability not configured".into(),
                )),
            },
        }
    }

    /// Ask the model to score how well the visible state matches the item's
    /// goal. Advisory: an unparseable or missing answer is `None`, and only
    /// `require_visual` turns a low score into a failure.
    async fn visual_check(&self, item: &WorkItem, screenshot: Option<&[u8]>) -> Option<f64> {
        let screenshot = screenshot?;
        let request = ModelRequest {
            turns: vec![
                Turn::pinned(
                    TurnRole::System,
                    "You score how well a screen matches a goal. \
                     Respond with only a JSON object: {\"confidence\": <0.0-1.0>}",
                ),
                Turn::instruction(format!(
                    "Goal: {}\n[screenshot attached: {} bytes]",
                    item.description,
                    screenshot.len()
                )),
            ],
            tool_contracts: Vec::new(),
            token_budget: 128,
        };

        let text = match self.model.complete(&request).await {
            Ok(response) => response.text?,
            Err(err) => {
                warn!("{}: visual check unavailable: {err}", item.id);
                return None;
            }
        };

        match serde_json::from_str::<serde_json::Value>(text.trim()) {
            Ok(value) => value.get("confidence").and_then(|c| c.as_f64()),
            Err(_) => {
                warn!("{}: visual check returned non-JSON answer", item.id);
                None
            }
        }
    }

    fn evaluate(
        &self,
        post: &Snapshot,
        visual_confidence: Option<f64>,
        act_error: Option<&EngineError>,
    ) -> VerifyOutcome {
        let structural_passed = act_error.is_none() && post.all_pass();
        let visual_passed = if self.config.require_visual {
            visual_confidence.is_some_and(|c| c >= self.config.visual_confidence_floor)
        } else {
            true
        };

        let mut failed_checks = post.failed_labels();
        if let Some(err) = act_error {
            failed_checks.insert(0, format!("act: {err}"));
        }
        if !visual_passed {
            failed_checks.push("visual confidence below floor".into());
        }

        VerifyOutcome {
            structural_passed,
            visual_confidence,
            passed: structural_passed && visual_passed,
            failed_checks,
        }
    }

    // ── Knowledge write-back ───────────────────────────────────────

    /// Search past failures by error category and inject the most relevant
    /// lessons into the next attempt's context.
    fn inject_lessons(
        &self,
        item: &WorkItem,
        category: &str,
        window: &mut ContextWindow,
    ) -> Result<(), EngineError> {
        let keywords: Vec<&str> = std::iter::once(category)
            .chain(item.description.split_whitespace())
            .collect();
        let lessons =
            self.knowledge
                .search(&keywords, Some(item.project.as_str()), self.config.lesson_limit);
        if lessons.is_empty() {
            return Ok(());
        }

        self.handler.on_event(&EngineEvent::LessonsInjected {
            item_id: &item.id,
            count: lessons.len(),
        });
        for lesson in &lessons {
            window.push(Turn::instruction(format!(
                "Lesson from a similar past failure ({}): {} — {}",
                lesson.entry.kind, lesson.entry.title, lesson.entry.content
            )))?;
        }
        Ok(())
    }

    /// Persist a recovery pattern after a success that needed retries.
    fn capture_recovery_pattern(
        &self,
        item: &WorkItem,
        attempts: u32,
        cycles: &[FeedbackCycle],
    ) -> Option<String> {
        let failures: Vec<String> = cycles[..cycles.len() - 1]
            .iter()
            .map(|c| c.action_taken.clone())
            .collect();
        let winning = cycles.last().map(|c| c.action_taken.clone())?;

        let entry = NewEntry::new(
            format!("recovered: {}", item.description),
            EntryKind::Pattern,
            format!(
                "Succeeded on attempt {attempts} after: {}. Winning action: {winning}.",
                failures.join("; ")
            ),
        )
        .with_tag("recovery")
        .with_task_ref(item.id.as_str())
        .with_project(item.project.as_str());

        match self.knowledge.add_entry(entry) {
            Ok(id) => {
                self.handler.on_event(&EngineEvent::RecoveryCaptured {
                    item_id: &item.id,
                    entry_id: &id,
                });
                Some(id)
            }
            Err(err) => {
                warn!("{}: could not capture recovery pattern: {err}", item.id);
                None
            }
        }
    }

    /// EXHAUSTED: persist the lesson and enqueue a higher-priority follow-up
    /// referencing the original item.
    fn escalate(&self, item: &WorkItem, last_error: &str) -> Result<(String, String), EngineError> {
        let lesson_ref = self.knowledge.add_entry(
            NewEntry::new(
                format!("exhausted: {}", item.description),
                EntryKind::LessonLearned,
                format!(
                    "All {} attempts failed. Last error: {last_error}",
                    self.config.max_attempts
                ),
            )
            .with_tag("exhausted")
            .with_task_ref(item.id.as_str())
            .with_project(item.project.as_str()),
        )?;

        let follow_up_id = self.queue.enqueue(
            WorkSpec::new(format!(
                "investigate and remediate {}: {}",
                item.id, item.description
            ))
            .with_priority(item.priority.escalated())
            .with_project(item.project.as_str()),
        )?;
        self.queue.attach_lesson(&follow_up_id, &lesson_ref)?;

        Ok((lesson_ref, follow_up_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ModelError, ModelFuture, ModelResponse};
    use crate::context::CompactorConfig;
    use crate::knowledge::EntryKind;
    use crate::queue::{Priority, WorkStatus};
    use crate::tools::contract::{CapFuture, CommandOutput, SHELL_RUN, ShellCapability};
    use crate::tools::testing::StubProcess;
    use crate::ToolCallRequest;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Shell that errors (infrastructure failure) a fixed number of times,
    /// then succeeds.
    struct FlakyShell {
        failures_remaining: AtomicU32,
    }

    impl FlakyShell {
        fn failing(times: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(times),
            }
        }
    }

    impl ShellCapability for FlakyShell {
        fn run(&self, _command: &str) -> CapFuture<'_, CommandOutput> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            let fail = remaining > 0;
            if fail {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            }
            Box::pin(async move {
                if fail {
                    Err(EngineError::ToolExecution("terminal session lost".into()))
                } else {
                    Ok(CommandOutput {
                        stdout: "ok".into(),
                        stderr: String::new(),
                        exit_code: 0,
                    })
                }
            })
        }
    }

    /// Model for loop tests: emits one shell call per ACT, then finishes
    /// with text once a tool result is visible; counts completions.
    struct ActModel {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ActModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelService for ActModel {
        fn complete(&self, request: &ModelRequest) -> ModelFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let finished = request
                .turns
                .last()
                .is_some_and(|t| t.role == TurnRole::Tool);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if finished {
                    Ok(ModelResponse {
                        text: Some("step complete".into()),
                        tool_calls: vec![],
                    })
                } else {
                    Ok(ModelResponse {
                        text: None,
                        tool_calls: vec![ToolCallRequest {
                            id: "c1".into(),
                            name: SHELL_RUN.into(),
                            arguments: r#"{"command": "systemctl start app"}"#.into(),
                        }],
                    })
                }
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        knowledge: Arc<KnowledgeStore>,
        queue: Arc<WorkQueue>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = Arc::new(KnowledgeStore::open(dir.path().join("knowledge")).unwrap());
        let queue = Arc::new(
            WorkQueue::open(
                dir.path().join("queue.jsonl"),
                RetryConfig::with_base(Duration::ZERO),
            )
            .unwrap(),
        );
        Fixture {
            _dir: dir,
            knowledge,
            queue,
        }
    }

    fn running_item(queue: &WorkQueue, spec: WorkSpec) -> WorkItem {
        let id = queue.enqueue(spec).unwrap();
        let item = queue.dequeue_next().unwrap().unwrap();
        assert_eq!(item.id, id);
        queue.mark_running(&id).unwrap();
        item
    }

    fn window() -> ContextWindow {
        let mut w = ContextWindow::new(CompactorConfig::new(100_000));
        w.push(Turn::pinned(TurnRole::System, "you drive one work item"))
            .unwrap();
        w.seal_prefix();
        w
    }

    fn fast_config() -> FeedbackConfig {
        FeedbackConfig::default().with_backoff(RetryConfig::with_base(Duration::ZERO))
    }

    fn loop_with(
        fx: &Fixture,
        model: Arc<dyn ModelService>,
        caps: CapabilitySet,
        config: FeedbackConfig,
    ) -> FeedbackLoop<'static> {
        FeedbackLoop::new(
            model,
            Arc::new(caps),
            Arc::clone(&fx.knowledge),
            Arc::clone(&fx.queue),
            config,
        )
    }

    #[tokio::test]
    async fn first_attempt_success_captures_no_pattern() {
        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(0)) as Arc<dyn ShellCapability>);
        let feedback = loop_with(&fx, Arc::new(ActModel::new()), caps, fast_config());

        let item = running_item(&fx.queue, WorkSpec::new("start the app"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        match report.outcome {
            LoopOutcome::Completed {
                attempts,
                pattern_ref,
            } => {
                assert_eq!(attempts, 1);
                assert!(pattern_ref.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(fx.knowledge.is_empty());
    }

    #[tokio::test]
    async fn two_failures_then_success_captures_one_pattern() {
        // ACT fails twice with a tool-execution error, then succeeds on
        // attempt 3 of 3 — completed, exactly one recovery pattern persisted.
        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(2)) as Arc<dyn ShellCapability>);
        let feedback = loop_with(&fx, Arc::new(ActModel::new()), caps, fast_config());

        let item = running_item(&fx.queue, WorkSpec::new("start the app"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        match report.outcome {
            LoopOutcome::Completed {
                attempts,
                pattern_ref,
            } => {
                assert_eq!(attempts, 3);
                assert!(pattern_ref.is_some());
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let patterns = fx
            .knowledge
            .entries_for_task(&item.id)
            .into_iter()
            .filter(|e| e.kind == EntryKind::Pattern)
            .count();
        assert_eq!(patterns, 1);
        assert_eq!(report.cycles.len(), 3);
        assert!(!report.cycles[0].outcome.passed);
        assert!(report.cycles[2].outcome.passed);
    }

    #[tokio::test]
    async fn exhaustion_persists_lesson_and_enqueues_follow_up() {
        // All 3 of 3 attempts fail: exhausted, one high-priority
        // follow-up referencing the original, one lesson persisted.
        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(99)) as Arc<dyn ShellCapability>);
        let feedback = loop_with(&fx, Arc::new(ActModel::new()), caps, fast_config());

        let item = running_item(
            &fx.queue,
            WorkSpec::new("start the app").with_priority(Priority::Medium),
        );
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        let (lesson_ref, follow_up_id) = match report.outcome {
            LoopOutcome::Exhausted {
                lesson_ref,
                follow_up_id,
                ..
            } => (lesson_ref, follow_up_id),
            other => panic!("expected exhaustion, got {other:?}"),
        };

        // One lesson, linked to the original item.
        let lessons = fx.knowledge.entries_for_task(&item.id);
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].kind, EntryKind::LessonLearned);
        assert_eq!(lessons[0].id, lesson_ref);

        // The follow-up is pending, escalated to high, references the original.
        let follow_up = fx.queue.get(&follow_up_id).unwrap();
        assert_eq!(follow_up.status, WorkStatus::Pending);
        assert_eq!(follow_up.priority, Priority::High);
        assert!(follow_up.description.contains(&item.id));
        assert_eq!(follow_up.lesson_ref.as_deref(), Some(lesson_ref.as_str()));

        assert!(report.cycles.last().unwrap().exhausted);
    }

    #[tokio::test]
    async fn pre_passing_checks_skip_act() {
        // Idempotency: the desired state already holds, so ACT never runs.
        let fx = fixture();
        let model = Arc::new(ActModel::new());
        let caps = CapabilitySet::new()
            .with_process(Arc::new(StubProcess::new(vec![], vec![8080])));
        let feedback = loop_with(&fx, model.clone(), caps, fast_config());

        let item = running_item(
            &fx.queue,
            WorkSpec::new("expose the service")
                .with_check(StructuralCheck::PortListening { port: 8080 }),
        );
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        assert!(matches!(
            report.outcome,
            LoopOutcome::Completed { attempts: 1, .. }
        ));
        assert_eq!(model.call_count(), 0, "model was invoked for a no-op");
        assert!(report.cycles[0].action_taken.contains("skipped"));
    }

    #[tokio::test]
    async fn structural_checks_gate_completion() {
        // ACT succeeds but the port never comes up: every attempt fails
        // verification and the loop exhausts.
        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(0)) as Arc<dyn ShellCapability>)
            .with_process(Arc::new(StubProcess::new(vec![], vec![])));
        let feedback = loop_with(&fx, Arc::new(ActModel::new()), caps, fast_config());

        let item = running_item(
            &fx.queue,
            WorkSpec::new("expose the service")
                .with_check(StructuralCheck::PortListening { port: 8080 }),
        );
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        match report.outcome {
            LoopOutcome::Exhausted { last_error, .. } => {
                assert!(last_error.contains("port:8080"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn act_timeout_feeds_retry_path() {
        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(0)) as Arc<dyn ShellCapability>);
        let config = fast_config()
            .with_max_attempts(1)
            .with_act_timeout(Duration::from_millis(20));
        let feedback = loop_with(
            &fx,
            Arc::new(ActModel::slow(Duration::from_secs(5))),
            caps,
            config,
        );

        let item = running_item(&fx.queue, WorkSpec::new("slow step"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        match report.outcome {
            LoopOutcome::Exhausted { last_error, .. } => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_request_is_fatal_not_retried() {
        struct BadRequestModel {
            calls: AtomicUsize,
        }
        impl ModelService for BadRequestModel {
            fn complete(&self, _request: &ModelRequest) -> ModelFuture<'_> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(ModelError::InvalidRequest("schema rejected".into())) })
            }
        }

        let fx = fixture();
        let model = Arc::new(BadRequestModel {
            calls: AtomicUsize::new(0),
        });
        let caps = CapabilitySet::new();
        let feedback = loop_with(&fx, model.clone(), caps, fast_config());

        let item = running_item(&fx.queue, WorkSpec::new("bad request"));
        let mut w = window();
        let err = feedback.drive(&item, &mut w).await.unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1, "fatal error was retried");
    }

    #[tokio::test]
    async fn resource_contention_propagates_without_consuming_attempts() {
        struct ContendedShell;
        impl ShellCapability for ContendedShell {
            fn run(&self, _command: &str) -> CapFuture<'_, CommandOutput> {
                Box::pin(async {
                    Err(EngineError::ResourceContention("gui focus held".into()))
                })
            }
        }

        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(ContendedShell) as Arc<dyn ShellCapability>);
        let feedback = loop_with(&fx, Arc::new(ActModel::new()), caps, fast_config());

        let item = running_item(&fx.queue, WorkSpec::new("needs the gui"));
        let mut w = window();
        let err = feedback.drive(&item, &mut w).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceContention(_)));
        // No lesson, no follow-up: the work was never attempted.
        assert!(fx.knowledge.is_empty());
    }

    #[tokio::test]
    async fn lessons_from_past_failures_are_injected() {
        let fx = fixture();
        fx.knowledge
            .add_entry(
                NewEntry::new(
                    "terminal session lost before",
                    EntryKind::LessonLearned,
                    "reconnect the terminal before the command",
                )
                .with_tag("tool-execution"),
            )
            .unwrap();

        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(1)) as Arc<dyn ShellCapability>);
        let recording = crate::events::testing::RecordingHandler::new();
        let feedback = FeedbackLoop::new(
            Arc::new(ActModel::new()),
            Arc::new(caps),
            Arc::clone(&fx.knowledge),
            Arc::clone(&fx.queue),
            fast_config(),
        )
        .with_event_handler(&recording);

        let item = running_item(&fx.queue, WorkSpec::new("start the app"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        assert!(matches!(report.outcome, LoopOutcome::Completed { .. }));
        // The lesson landed in the window for attempt 2.
        assert!(
            w.turns()
                .iter()
                .any(|t| t.content.contains("reconnect the terminal"))
        );
        let events = recording.events.lock().unwrap();
        assert!(events.iter().any(|e| e.contains("LessonsInjected")));
    }

    #[tokio::test]
    async fn visual_advisory_does_not_block_completion() {
        // GUI present but the model's visual answer is unparseable: with the
        // default advisory policy the item still completes.
        struct NonJsonVisualModel {
            inner: ActModel,
        }
        impl ModelService for NonJsonVisualModel {
            fn complete(&self, request: &ModelRequest) -> ModelFuture<'_> {
                if request.tool_contracts.is_empty() && request.token_budget == 128 {
                    return Box::pin(async {
                        Ok(ModelResponse {
                            text: Some("looks fine to me".into()),
                            tool_calls: vec![],
                        })
                    });
                }
                self.inner.complete(request)
            }
        }

        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(0)) as Arc<dyn ShellCapability>)
            .with_gui(Arc::new(crate::tools::testing::StubGui::new()));
        let feedback = loop_with(
            &fx,
            Arc::new(NonJsonVisualModel {
                inner: ActModel::new(),
            }),
            caps,
            fast_config(),
        );

        let item = running_item(&fx.queue, WorkSpec::new("gui task"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();
        assert!(matches!(report.outcome, LoopOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn required_visual_below_floor_fails_verification() {
        struct LowConfidenceModel {
            inner: ActModel,
        }
        impl ModelService for LowConfidenceModel {
            fn complete(&self, request: &ModelRequest) -> ModelFuture<'_> {
                if request.tool_contracts.is_empty() && request.token_budget == 128 {
                    return Box::pin(async {
                        Ok(ModelResponse {
                            text: Some(r#"{"confidence": 0.2}"#.into()),
                            tool_calls: vec![],
                        })
                    });
                }
                self.inner.complete(request)
            }
        }

        let fx = fixture();
        let caps = CapabilitySet::new()
            .with_shell(Arc::new(FlakyShell::failing(0)) as Arc<dyn ShellCapability>)
            .with_gui(Arc::new(crate::tools::testing::StubGui::new()));
        let config = fast_config()
            .with_max_attempts(1)
            .with_require_visual(true);
        let feedback = loop_with(
            &fx,
            Arc::new(LowConfidenceModel {
                inner: ActModel::new(),
            }),
            caps,
            config,
        );

        let item = running_item(&fx.queue, WorkSpec::new("gui task"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();
        match report.outcome {
            LoopOutcome::Exhausted { last_error, .. } => {
                assert!(last_error.contains("visual"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(
            report.cycles[0].outcome.visual_confidence,
            Some(0.2)
        );
    }

    #[tokio::test]
    async fn delegation_fans_into_coordinator() {
        // The loop's model delegates two research sub-steps, each served by
        // an isolated subagent through the bounded pool, then synthesizes.
        struct DelegatingModel;
        impl ModelService for DelegatingModel {
            fn complete(&self, request: &ModelRequest) -> ModelFuture<'_> {
                let is_subagent = request
                    .turns
                    .first()
                    .is_some_and(|t| t.content.contains("focused"));
                let has_results = request.turns.iter().any(|t| t.role == TurnRole::Tool);
                Box::pin(async move {
                    if is_subagent {
                        return Ok(ModelResponse {
                            text: Some("sub finding".into()),
                            tool_calls: vec![],
                        });
                    }
                    if has_results {
                        return Ok(ModelResponse {
                            text: Some("combined findings".into()),
                            tool_calls: vec![],
                        });
                    }
                    Ok(ModelResponse {
                        text: None,
                        tool_calls: vec![ToolCallRequest {
                            id: "d1".into(),
                            name: DELEGATE_TOOL.into(),
                            arguments: r#"{"tasks": [
                                {"role": "research", "instruction": "scan the logs"},
                                {"role": "research", "instruction": "check the ports"}
                            ]}"#
                            .into(),
                        }],
                    })
                })
            }
        }

        let fx = fixture();
        let model: Arc<dyn ModelService> = Arc::new(DelegatingModel);
        let caps = Arc::new(
            CapabilitySet::new().with_process(Arc::new(StubProcess::new(vec![], vec![]))),
        );
        let coordinator = Arc::new(SubagentCoordinator::new(
            Arc::clone(&model),
            Arc::clone(&caps),
            2,
        ));
        let feedback = FeedbackLoop::new(
            model,
            caps,
            Arc::clone(&fx.knowledge),
            Arc::clone(&fx.queue),
            fast_config(),
        )
        .with_coordinator(Arc::clone(&coordinator));

        let item = running_item(&fx.queue, WorkSpec::new("investigate the outage"));
        let mut w = window();
        let report = feedback.drive(&item, &mut w).await.unwrap();

        assert!(matches!(report.outcome, LoopOutcome::Completed { .. }));
        let delegate_result = w
            .turns()
            .iter()
            .find(|t| t.role == TurnRole::Tool)
            .expect("delegation result turn");
        assert!(delegate_result.content.contains("task 1"));
        assert!(delegate_result.content.contains("sub finding"));
        assert!(coordinator.peak_running() <= 2);
    }

    #[test]
    fn structural_check_serde_roundtrip() {
        let check = StructuralCheck::PortListening { port: 8080 };
        let json = serde_json::to_string(&check).unwrap();
        assert!(json.contains("port_listening"));
        let back: StructuralCheck = serde_json::from_str(&json).unwrap();
        assert_eq!(back, check);
    }

    #[test]
    fn check_labels_are_stable() {
        assert_eq!(
            StructuralCheck::FileExists {
                path: "/etc/app.conf".into()
            }
            .label(),
            "file:/etc/app.conf"
        );
        assert_eq!(
            StructuralCheck::CommandSucceeds {
                command: "true".into()
            }
            .label(),
            "command:true"
        );
    }
}
