//! Convenience re-exports for common `drover-rs` types.
//!
//! Meant to be glob-imported when embedding the engine:
//!
//! ```ignore
//! use drover_rs::prelude::*;
//! ```
//!
//! This pulls in the types needed for the vast majority of embedders: the
//! [`Orchestrator`] and its config, the queue and knowledge surfaces, the
//! capability traits, and the error taxonomy. Specialized types (compactor
//! internals, transcript records, delegation arguments) are intentionally
//! excluded — import those from their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::error::EngineError;
pub use crate::{ToolCallRequest, ToolContract, Turn, TurnClass, TurnRole, json_schema_for};

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::OrchestratorConfig;
pub use crate::orchestrator::{Orchestrator, StatusReport, TickOutcome};

// ── Queue & knowledge ───────────────────────────────────────────────
pub use crate::knowledge::{EntryKind, KnowledgeEntry, KnowledgeStore, NewEntry};
pub use crate::queue::{AckOutcome, Priority, WorkItem, WorkQueue, WorkSpec, WorkStatus};

// ── Loop & coordination ─────────────────────────────────────────────
pub use crate::coordinator::{
    SubagentCoordinator, SubagentHandle, SubagentResult, SubagentSpec, SubagentStatus,
};
pub use crate::feedback::{FeedbackConfig, FeedbackLoop, LoopOutcome, StructuralCheck};

// ── Boundaries ──────────────────────────────────────────────────────
pub use crate::api::{HttpModelClient, ModelRequest, ModelResponse, ModelService, RetryConfig};
pub use crate::events::{EventHandler, LoggingHandler, NoopHandler};
pub use crate::tools::{
    CapabilitySet, FileCapability, GuiCapability, ProcessCapability, ShellCapability,
    SubagentRole,
};
