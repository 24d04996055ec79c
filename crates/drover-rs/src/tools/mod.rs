//! Capability contracts: the only way the engine touches the outside world.
//!
//! Concrete tools (a real shell, a real screen) live outside the engine.
//! What the engine sees is a fixed set of capability interfaces — shell
//! execution, file operations, GUI control, process/network inspection —
//! bundled into a [`CapabilitySet`] that advertises [`ToolContract`]s to the
//! model and dispatches validated tool calls back to whichever capabilities
//! are present.
//!
//! - [`contract`] — the capability traits, typed argument structs, and the
//!   schema-validated dispatch path.
//! - [`access`] — [`SubagentRole`] and the per-role tool allowlists that keep
//!   verification and research subagents read-only.

pub mod access;
pub mod contract;

pub use access::{SubagentRole, ToolAccess};
pub use contract::{
    CapFuture, CapabilitySet, CommandOutput, FileCapability, GuiCapability, ProcessCapability,
    ShellCapability,
};

#[cfg(test)]
pub(crate) mod testing;
