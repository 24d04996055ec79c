//! Per-role tool allowlists.
//!
//! Subagent roles bound both blast radius and token usage: a verification
//! agent can look but not touch, a file-ops agent never drives the GUI, and
//! a coordination agent talks to the model only. [`ToolAccess`] filters a
//! capability set's contracts down to what a role is allowed to invoke and
//! guards dispatch against calls outside the allowlist.

use super::contract::{
    self, FILE_EDIT, FILE_READ, FILE_WRITE, GUI_CLICK, GUI_KEY, GUI_SCREENSHOT, GUI_TYPE,
    PORT_LISTENING, PROC_LIST, SHELL_RUN,
};
use crate::ToolContract;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specialization of a dispatched subagent.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubagentRole {
    /// General execution: full tool access.
    Execution,
    /// Read-only checking: may observe, never mutate.
    Verification,
    /// File manipulation only.
    FileOps,
    /// Read-only investigation.
    Research,
    /// Synthesis and planning: no tools at all, model only.
    Coordination,
}

impl std::fmt::Display for SubagentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SubagentRole::Execution => "execution",
            SubagentRole::Verification => "verification",
            SubagentRole::FileOps => "file_ops",
            SubagentRole::Research => "research",
            SubagentRole::Coordination => "coordination",
        };
        write!(f, "{label}")
    }
}

impl SubagentRole {
    /// Tool names this role may invoke.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            SubagentRole::Execution => &[
                SHELL_RUN,
                FILE_READ,
                FILE_WRITE,
                FILE_EDIT,
                GUI_SCREENSHOT,
                GUI_CLICK,
                GUI_TYPE,
                GUI_KEY,
                PROC_LIST,
                PORT_LISTENING,
            ],
            SubagentRole::Verification => {
                &[FILE_READ, GUI_SCREENSHOT, PROC_LIST, PORT_LISTENING]
            }
            SubagentRole::FileOps => &[FILE_READ, FILE_WRITE, FILE_EDIT],
            SubagentRole::Research => &[FILE_READ, PROC_LIST, PORT_LISTENING],
            SubagentRole::Coordination => &[],
        }
    }
}

/// Role-scoped view over a capability set's contracts.
#[derive(Clone, Copy, Debug)]
pub struct ToolAccess {
    role: SubagentRole,
}

impl ToolAccess {
    pub fn for_role(role: SubagentRole) -> Self {
        Self { role }
    }

    pub fn role(&self) -> SubagentRole {
        self.role
    }

    /// Whether this role may invoke the named tool.
    pub fn permits(&self, tool_name: &str) -> bool {
        self.role.allowed_tools().contains(&tool_name)
    }

    /// Filter a contract list down to what this role may see.
    pub fn filter_contracts(&self, contracts: Vec<ToolContract>) -> Vec<ToolContract> {
        contracts
            .into_iter()
            .filter(|c| self.permits(&c.name))
            .collect()
    }
}
