//! Durable autonomous task orchestration for model-driven agent work.
//!
//! `drover-rs` keeps long-running, multi-step agent work reliable when each
//! step is executed by an external reasoning model and a set of fallible
//! side-effecting tools. The core abstraction is the
//! [`Orchestrator`](orchestrator::Orchestrator) — a tick loop that pops ready
//! items from a persistent priority [`WorkQueue`](queue::WorkQueue), consults
//! the [`KnowledgeStore`](knowledge::KnowledgeStore) for lessons from past
//! failures, and drives each item through a
//! [`FeedbackLoop`](feedback::FeedbackLoop) of gather → act → verify → retry,
//! fanning parallel sub-steps into a bounded
//! [`SubagentCoordinator`](coordinator::SubagentCoordinator).
//!
//! Everything the engine learns is written back: recovered failures become
//! searchable patterns, exhausted retries become lessons plus a deferred
//! higher-priority work item, and every run leaves an append-only transcript.
//!
//! # Getting started
//!
//! ```ignore
//! use drover_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let model = HttpModelClient::new(std::env::var("DROVER_MODEL_KEY").unwrap())?;
//!     let caps = CapabilitySet::new().with_shell(my_shell);
//!
//!     let config = OrchestratorConfig::new(".drover")
//!         .with_max_concurrent_subagents(3)
//!         .with_context_budget(120_000);
//!
//!     let engine = Orchestrator::open(config, Arc::new(model), Arc::new(caps))?;
//!     engine.queue().enqueue(WorkSpec::new("bring up the staging server")
//!         .with_priority(Priority::High))?;
//!     engine.run().await
//! }
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Enqueue and track work:** see [`queue::WorkQueue`], [`queue::WorkSpec`],
//!   and [`queue::WorkItem`]. Every mutation is journaled before the call
//!   returns; restart replays the journal.
//! - **Record and search outcomes:** see [`knowledge::KnowledgeStore`] —
//!   append-only entries ranked by keyword overlap, tag overlap, and recency.
//! - **Keep a loop within its token budget:** see [`context::ContextWindow`] —
//!   chunked, cache-stable eviction with a reserved recency floor.
//! - **Run isolated sub-tasks:** see [`coordinator::SubagentCoordinator`] and
//!   [`tools::SubagentRole`] for per-role tool allowlists.
//! - **Plug in a model backend:** implement [`api::ModelService`], or use the
//!   bundled [`api::HttpModelClient`].
//! - **Expose tools:** implement the capability traits in [`tools`] and bundle
//!   them into a [`tools::CapabilitySet`].
//! - **Observe the engine:** implement [`events::EventHandler`], or use
//!   [`events::LoggingHandler`] for tracing-based output.
//!
//! # Design principles
//!
//! 1. **Durability before acknowledgement.** A queue mutation that has not
//!    reached the journal has not happened. A crash mid-cycle never loses or
//!    duplicates an item.
//!
//! 2. **Failures are data.** Every exhausted retry produces a lesson and a
//!    deferred work item; every multi-attempt recovery produces a pattern.
//!    Future loops read them before acting.
//!
//! 3. **Context is the scarcest resource.** Each loop owns exactly one
//!    token-budgeted window; eviction is chunked and cache-stable, and
//!    overflow is an error, never a silent truncation.
//!
//! 4. **Capabilities are contracts.** The engine never touches a shell, file,
//!    or screen directly — only the fixed capability interfaces, restricted
//!    per subagent role.

pub mod api;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod feedback;
pub mod knowledge;
pub mod orchestrator;
pub mod prelude;
pub mod queue;
pub mod tools;
pub mod transcript;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types and
/// the tool-contract schemas sent across the model boundary.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Conversation turns ─────────────────────────────────────────────

/// Role of a turn in a loop's conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::System => write!(f, "system"),
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
            TurnRole::Tool => write!(f, "tool"),
        }
    }
}

/// Removability class of a turn, consulted by the context compactor.
///
/// Ordering is eviction precedence: [`TurnClass::Artifact`] goes first
/// (screenshots, large captures), [`TurnClass::ToolResult`] next,
/// [`TurnClass::Reasoning`] last. [`TurnClass::Pinned`] is never evicted —
/// it anchors the conversation and the model-side prompt cache.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TurnClass {
    Artifact,
    ToolResult,
    Reasoning,
    Pinned,
}

/// One turn of a loop's conversation: role, content, and removability class.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub class: TurnClass,
}

impl Turn {
    /// An anchoring turn that is never evicted (system preamble, task framing).
    pub fn pinned(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            class: TurnClass::Pinned,
        }
    }

    /// Assistant reasoning or plain text — evicted last.
    pub fn reasoning(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            class: TurnClass::Reasoning,
        }
    }

    /// A tool result — evictable once stale.
    pub fn tool_result(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: content.into(),
            class: TurnClass::ToolResult,
        }
    }

    /// A large captured artifact (screenshot description, log dump) — evicted first.
    pub fn artifact(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: content.into(),
            class: TurnClass::Artifact,
        }
    }

    /// A user-role instruction turn, evictable as reasoning.
    pub fn instruction(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            class: TurnClass::Reasoning,
        }
    }
}

// ── Tool contracts & calls ─────────────────────────────────────────

/// A capability contract advertised to the model: name, description, and a
/// JSON Schema for the arguments.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolContract {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolContract {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool call emitted by the model: which contract to invoke and the raw
/// JSON arguments string.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

// ── Id generation ──────────────────────────────────────────────────

static ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique, restart-safe id with the given prefix.
///
/// Combines epoch milliseconds with a process-local counter so ids stay
/// unique across restarts without a random source: `wk-18f3a2c41b7-42`.
pub fn fresh_id(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{millis:x}-{seq}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_constructors_set_class() {
        assert_eq!(
            Turn::pinned(TurnRole::System, "anchor").class,
            TurnClass::Pinned
        );
        assert_eq!(Turn::reasoning("thought").class, TurnClass::Reasoning);
        assert_eq!(Turn::tool_result("ok").class, TurnClass::ToolResult);
        assert_eq!(Turn::artifact("png bytes").class, TurnClass::Artifact);
        assert_eq!(Turn::instruction("do it").role, TurnRole::User);
    }

    #[test]
    fn turn_class_eviction_precedence() {
        // Artifacts evict before tool results, tool results before reasoning,
        // and pinned turns sort last (never evicted).
        assert!(TurnClass::Artifact < TurnClass::ToolResult);
        assert!(TurnClass::ToolResult < TurnClass::Reasoning);
        assert!(TurnClass::Reasoning < TurnClass::Pinned);
    }

    #[test]
    fn fresh_ids_are_unique_and_prefixed() {
        let a = fresh_id("wk");
        let b = fresh_id("wk");
        assert!(a.starts_with("wk-"));
        assert_ne!(a, b);
    }

    #[test]
    fn json_schema_for_derived_type() {
        #[derive(serde::Deserialize, JsonSchema)]
        struct Args {
            #[allow(dead_code)]
            path: String,
        }
        let schema = json_schema_for::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(
            schema["required"]
                .as_array()
                .is_some_and(|r| r.contains(&"path".into()))
        );
    }

    #[test]
    fn turn_serde_roundtrip() {
        let turn = Turn::tool_result("exit 0");
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, TurnRole::Tool);
        assert_eq!(back.class, TurnClass::ToolResult);
        assert_eq!(back.content, "exit 0");
    }
}
