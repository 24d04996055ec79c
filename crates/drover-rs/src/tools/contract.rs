//! Capability traits, typed arguments, and schema-validated dispatch.
//!
//! Each trait mirrors one external collaborator: shell execution, file
//! operations, GUI control, process/network inspection. Implementors live
//! outside the engine; the [`CapabilitySet`] bundles whichever are present,
//! exports their [`ToolContract`]s for the model, and dispatches incoming
//! tool calls after validating arguments against the contract schema.
//!
//! Dispatch results are plain strings — they are fed straight back to the
//! model as tool-result turns, so capability errors are rendered as
//! `"Error: ..."` strings rather than propagated, and only infrastructure
//! failures (unknown tool, absent capability, invalid arguments) surface as
//! [`EngineError`].

use crate::error::EngineError;
use crate::{ToolCallRequest, ToolContract, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, trace};

/// Boxed future returned by capability methods.
///
/// Type alias to keep the traits dyn-compatible (object-safe).
pub type CapFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

// ── Tool names ─────────────────────────────────────────────────────

pub const SHELL_RUN: &str = "shell_run";
pub const FILE_READ: &str = "file_read";
pub const FILE_WRITE: &str = "file_write";
pub const FILE_EDIT: &str = "file_edit";
pub const GUI_SCREENSHOT: &str = "gui_screenshot";
pub const GUI_CLICK: &str = "gui_click";
pub const GUI_TYPE: &str = "gui_type";
pub const GUI_KEY: &str = "gui_key";
pub const PROC_LIST: &str = "proc_list";
pub const PORT_LISTENING: &str = "port_listening";

/// Tool names that mutate external state. Read-only roles never see these.
pub const MUTATING_TOOLS: &[&str] = &[
    SHELL_RUN, FILE_WRITE, FILE_EDIT, GUI_CLICK, GUI_TYPE, GUI_KEY,
];

// ── Capability traits ──────────────────────────────────────────────

/// Output of one shell command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Render for a tool-result turn.
    pub fn to_result_string(&self) -> String {
        format!(
            "exit code: {}\nstdout:\n{}\nstderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Shell execution.
pub trait ShellCapability: Send + Sync {
    fn run(&self, command: &str) -> CapFuture<'_, CommandOutput>;
}

/// File operations.
pub trait FileCapability: Send + Sync {
    fn read(&self, path: &str) -> CapFuture<'_, String>;
    fn write(&self, path: &str, content: &str) -> CapFuture<'_, ()>;
    fn edit(&self, path: &str, old_text: &str, new_text: &str) -> CapFuture<'_, ()>;
}

/// GUI control. Screenshot bytes are an opaque image payload.
pub trait GuiCapability: Send + Sync {
    fn screenshot(&self) -> CapFuture<'_, Vec<u8>>;
    fn click(&self, x: u32, y: u32) -> CapFuture<'_, ()>;
    fn type_text(&self, text: &str) -> CapFuture<'_, ()>;
    fn key(&self, combo: &str) -> CapFuture<'_, ()>;
}

/// Process and network inspection.
pub trait ProcessCapability: Send + Sync {
    fn list_processes(&self) -> CapFuture<'_, Vec<String>>;
    fn port_listening(&self, port: u16) -> CapFuture<'_, bool>;
}

// ── Typed arguments ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ShellRunArgs {
    /// The shell command to execute.
    pub command: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct FileReadArgs {
    pub path: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct FileWriteArgs {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct FileEditArgs {
    pub path: String,
    /// Exact text to replace.
    pub old_text: String,
    pub new_text: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct GuiClickArgs {
    pub x: u32,
    pub y: u32,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct GuiTypeArgs {
    pub text: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct GuiKeyArgs {
    /// Key combination, e.g. "ctrl+s".
    pub combo: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct PortArgs {
    pub port: u16,
}

/// Empty-argument tools (screenshot, process list).
#[derive(Deserialize, JsonSchema, Debug)]
pub struct NoArgs {}

// ── CapabilitySet ──────────────────────────────────────────────────

/// The capabilities available to one orchestrator instance.
///
/// Any subset may be present. Contracts are exported only for present
/// capabilities, so the model never sees a tool it cannot call.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    shell: Option<Arc<dyn ShellCapability>>,
    files: Option<Arc<dyn FileCapability>>,
    gui: Option<Arc<dyn GuiCapability>>,
    process: Option<Arc<dyn ProcessCapability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellCapability>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileCapability>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_gui(mut self, gui: Arc<dyn GuiCapability>) -> Self {
        self.gui = Some(gui);
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ProcessCapability>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn shell(&self) -> Option<&Arc<dyn ShellCapability>> {
        self.shell.as_ref()
    }

    pub fn files(&self) -> Option<&Arc<dyn FileCapability>> {
        self.files.as_ref()
    }

    pub fn gui(&self) -> Option<&Arc<dyn GuiCapability>> {
        self.gui.as_ref()
    }

    pub fn process(&self) -> Option<&Arc<dyn ProcessCapability>> {
        self.process.as_ref()
    }

    /// Export contracts for every present capability.
    pub fn contracts(&self) -> Vec<ToolContract> {
        let mut contracts = Vec::new();

        if self.shell.is_some() {
            contracts.push(ToolContract::new(
                SHELL_RUN,
                "Run a shell command and return stdout, stderr, and the exit code.",
                json_schema_for::<ShellRunArgs>(),
            ));
        }
        if self.files.is_some() {
            contracts.push(ToolContract::new(
                FILE_READ,
                "Read a file and return its contents.",
                json_schema_for::<FileReadArgs>(),
            ));
            contracts.push(ToolContract::new(
                FILE_WRITE,
                "Write content to a file, replacing it if it exists.",
                json_schema_for::<FileWriteArgs>(),
            ));
            contracts.push(ToolContract::new(
                FILE_EDIT,
                "Replace an exact text span in a file.",
                json_schema_for::<FileEditArgs>(),
            ));
        }
        if self.gui.is_some() {
            contracts.push(ToolContract::new(
                GUI_SCREENSHOT,
                "Capture a screenshot of the current screen.",
                json_schema_for::<NoArgs>(),
            ));
            contracts.push(ToolContract::new(
                GUI_CLICK,
                "Click at screen coordinates (x, y).",
                json_schema_for::<GuiClickArgs>(),
            ));
            contracts.push(ToolContract::new(
                GUI_TYPE,
                "Type text into the focused element.",
                json_schema_for::<GuiTypeArgs>(),
            ));
            contracts.push(ToolContract::new(
                GUI_KEY,
                "Press a key combination, e.g. \"ctrl+s\".",
                json_schema_for::<GuiKeyArgs>(),
            ));
        }
        if self.process.is_some() {
            contracts.push(ToolContract::new(
                PROC_LIST,
                "List running process names.",
                json_schema_for::<NoArgs>(),
            ));
            contracts.push(ToolContract::new(
                PORT_LISTENING,
                "Check whether a local TCP port has a listener.",
                json_schema_for::<PortArgs>(),
            ));
        }

        contracts
    }

    /// Validate a call's arguments against the contract schema, then route it
    /// to the owning capability. The returned string is the tool-result turn
    /// content.
    pub async fn dispatch(&self, call: &ToolCallRequest) -> Result<String, EngineError> {
        let contract = self
            .contracts()
            .into_iter()
            .find(|c| c.name == call.name)
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown or unavailable tool '{}'", call.name))
            })?;

        let args_value = validate_arguments(&contract, &call.arguments)?;
        trace!("dispatching {}({})", call.name, call.arguments);

        let result = match call.name.as_str() {
            SHELL_RUN => {
                let args: ShellRunArgs = parse_args(args_value)?;
                let out = self.require_shell()?.run(&args.command).await?;
                out.to_result_string()
            }
            FILE_READ => {
                let args: FileReadArgs = parse_args(args_value)?;
                self.require_files()?.read(&args.path).await?
            }
            FILE_WRITE => {
                let args: FileWriteArgs = parse_args(args_value)?;
                self.require_files()?
                    .write(&args.path, &args.content)
                    .await?;
                format!("wrote {} bytes to {}", args.content.len(), args.path)
            }
            FILE_EDIT => {
                let args: FileEditArgs = parse_args(args_value)?;
                self.require_files()?
                    .edit(&args.path, &args.old_text, &args.new_text)
                    .await?;
                format!("edited {}", args.path)
            }
            GUI_SCREENSHOT => {
                let shot = self.require_gui()?.screenshot().await?;
                format!("[screenshot captured: {} bytes]", shot.len())
            }
            GUI_CLICK => {
                let args: GuiClickArgs = parse_args(args_value)?;
                self.require_gui()?.click(args.x, args.y).await?;
                format!("clicked ({}, {})", args.x, args.y)
            }
            GUI_TYPE => {
                let args: GuiTypeArgs = parse_args(args_value)?;
                self.require_gui()?.type_text(&args.text).await?;
                format!("typed {} chars", args.text.len())
            }
            GUI_KEY => {
                let args: GuiKeyArgs = parse_args(args_value)?;
                self.require_gui()?.key(&args.combo).await?;
                format!("pressed {}", args.combo)
            }
            PROC_LIST => {
                let procs = self.require_process()?.list_processes().await?;
                procs.join("\n")
            }
            PORT_LISTENING => {
                let args: PortArgs = parse_args(args_value)?;
                let listening = self.require_process()?.port_listening(args.port).await?;
                format!("port {} listening: {}", args.port, listening)
            }
            other => {
                return Err(EngineError::Validation(format!("unknown tool '{other}'")));
            }
        };

        debug!("{} -> {} chars", call.name, result.len());
        Ok(result)
    }

    fn require_shell(&self) -> Result<&Arc<dyn ShellCapability>, EngineError> {
        self.shell
            .as_ref()
            .ok_or_else(|| EngineError::ToolExecution("shell capability not configured".into()))
    }

    fn require_files(&self) -> Result<&Arc<dyn FileCapability>, EngineError> {
        self.files
            .as_ref()
            .ok_or_else(|| EngineError::ToolExecution("file capability not configured".into()))
    }

    fn require_gui(&self) -> Result<&Arc<dyn GuiCapability>, EngineError> {
        self.gui
            .as_ref()
            .ok_or_else(|| EngineError::ToolExecution("gui capability not configured".into()))
    }

    fn require_process(&self) -> Result<&Arc<dyn ProcessCapability>, EngineError> {
        self.process
            .as_ref()
            .ok_or_else(|| EngineError::ToolExecution("process capability not configured".into()))
    }
}

// ── Argument validation ────────────────────────────────────────────

/// Parse and validate raw arguments against a contract schema.
fn validate_arguments(
    contract: &ToolContract,
    arguments: &str,
) -> Result<serde_json::Value, EngineError> {
    let args_value: serde_json::Value = serde_json::from_str(arguments).map_err(|e| {
        EngineError::Validation(format!(
            "invalid JSON arguments for tool '{}': {e}",
            contract.name
        ))
    })?;

    // If the schema itself fails to compile, skip validation rather than
    // rejecting the call — serde parsing below still enforces the types.
    if let Ok(validator) = jsonschema::validator_for(&contract.parameters) {
        let errors: Vec<String> = validator
            .iter_errors(&args_value)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if !errors.is_empty() {
            return Err(EngineError::Validation(format!(
                "argument validation failed for tool '{}': {}",
                contract.name,
                errors.join("; ")
            )));
        }
    }

    Ok(args_value)
}

fn parse_args<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Validation(format!("bad arguments: {e}")))
}
