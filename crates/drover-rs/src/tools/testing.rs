//! In-memory capability stubs shared by the crate's tests.

use super::contract::{
    CapFuture, CommandOutput, FileCapability, GuiCapability, ProcessCapability, ShellCapability,
};
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shell stub that records commands and returns a fixed exit code.
pub struct StubShell {
    exit_code: i32,
    pub commands: Mutex<Vec<String>>,
}

impl StubShell {
    pub fn succeeding() -> Self {
        Self {
            exit_code: 0,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

impl ShellCapability for StubShell {
    fn run(&self, command: &str) -> CapFuture<'_, CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let exit_code = self.exit_code;
        Box::pin(async move {
            Ok(CommandOutput {
                stdout: "stub output".into(),
                stderr: String::new(),
                exit_code,
            })
        })
    }
}

/// In-memory file capability.
pub struct StubFiles {
    files: Mutex<HashMap<String, String>>,
}

impl StubFiles {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl FileCapability for StubFiles {
    fn read(&self, path: &str) -> CapFuture<'_, String> {
        let result = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::ToolExecution(format!("no such file: {path}")));
        Box::pin(async move { result })
    }

    fn write(&self, path: &str, content: &str) -> CapFuture<'_, ()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Box::pin(async move { Ok(()) })
    }

    fn edit(&self, path: &str, old_text: &str, new_text: &str) -> CapFuture<'_, ()> {
        let mut files = self.files.lock().unwrap();
        let result = match files.get(path) {
            Some(content) if content.contains(old_text) => {
                let updated = content.replacen(old_text, new_text, 1);
                files.insert(path.to_string(), updated);
                Ok(())
            }
            Some(_) => Err(EngineError::ToolExecution(format!(
                "old_text not found in {path}"
            ))),
            None => Err(EngineError::ToolExecution(format!("no such file: {path}"))),
        };
        Box::pin(async move { result })
    }
}

/// Process/port stub with fixed answers.
pub struct StubProcess {
    processes: Vec<String>,
    listening: Vec<u16>,
}

impl StubProcess {
    pub fn new(processes: Vec<String>, listening: Vec<u16>) -> Self {
        Self {
            processes,
            listening,
        }
    }
}

impl ProcessCapability for StubProcess {
    fn list_processes(&self) -> CapFuture<'_, Vec<String>> {
        let procs = self.processes.clone();
        Box::pin(async move { Ok(procs) })
    }

    fn port_listening(&self, port: u16) -> CapFuture<'_, bool> {
        let listening = self.listening.contains(&port);
        Box::pin(async move { Ok(listening) })
    }
}

/// GUI stub that counts interactions and returns a tiny screenshot payload.
pub struct StubGui {
    pub interactions: AtomicUsize,
}

impl StubGui {
    pub fn new() -> Self {
        Self {
            interactions: AtomicUsize::new(0),
        }
    }
}

impl GuiCapability for StubGui {
    fn screenshot(&self) -> CapFuture<'_, Vec<u8>> {
        Box::pin(async move { Ok(vec![0u8; 16]) })
    }

    fn click(&self, _x: u32, _y: u32) -> CapFuture<'_, ()> {
        self.interactions.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(()) })
    }

    fn type_text(&self, _text: &str) -> CapFuture<'_, ()> {
        self.interactions.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(()) })
    }

    fn key(&self, _combo: &str) -> CapFuture<'_, ()> {
        self.interactions.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(()) })
    }
}
