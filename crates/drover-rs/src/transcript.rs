//! Append-only per-run transcripts for crash recovery and audit.
//!
//! Every run writes `{role, content, timestamp}` records to
//! `<dir>/<run-id>.jsonl` as they happen. Transcripts are evidence: they are
//! never rewritten, and a transcript that fails to parse at recovery time is
//! [`EngineError::StateCorruption`] — surfaced for manual intervention, not
//! silently repaired.

use crate::TurnRole;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// One transcript line.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TranscriptRecord {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Appending writer for one run's transcript.
pub struct TranscriptWriter {
    file: Mutex<File>,
    path: PathBuf,
}

impl TranscriptWriter {
    /// Create (or continue) the transcript for `run_id` under `dir`.
    pub fn create(dir: &Path, run_id: &str) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::StateCorruption(format!("cannot create transcript dir: {e}"))
        })?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::StateCorruption(format!("cannot open transcript: {e}")))?;
        debug!("transcript at {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. On disk before the call returns.
    pub fn append(&self, role: TurnRole, content: impl Into<String>) -> Result<(), EngineError> {
        let record = TranscriptRecord {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| EngineError::StateCorruption(format!("transcript encode failed: {e}")))?;
        line.push('\n');

        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| EngineError::StateCorruption(format!("transcript write failed: {e}")))
    }
}

/// Load a transcript for recovery or audit. Any malformed line is
/// [`EngineError::StateCorruption`].
pub fn load_transcript(path: &Path) -> Result<Vec<TranscriptRecord>, EngineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::StateCorruption(format!("cannot read transcript: {e}")))?;

    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TranscriptRecord = serde_json::from_str(line).map_err(|e| {
            EngineError::StateCorruption(format!(
                "malformed transcript record at line {}: {e}",
                lineno + 1
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::create(dir.path(), "run-1").unwrap();

        writer.append(TurnRole::User, "start the app").unwrap();
        writer.append(TurnRole::Assistant, "running systemctl").unwrap();
        writer.append(TurnRole::Tool, "exit code: 0").unwrap();

        let records = load_transcript(writer.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].role, TurnRole::User);
        assert_eq!(records[2].content, "exit code: 0");
        assert!(records[0].timestamp <= records[2].timestamp);
    }

    #[test]
    fn reopening_continues_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = TranscriptWriter::create(dir.path(), "run-2").unwrap();
            writer.append(TurnRole::User, "before crash").unwrap();
        }
        let writer = TranscriptWriter::create(dir.path(), "run-2").unwrap();
        writer.append(TurnRole::User, "after restart").unwrap();

        let records = load_transcript(writer.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "before crash");
        assert_eq!(records[1].content, "after restart");
    }

    #[test]
    fn malformed_transcript_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-3.jsonl");
        std::fs::write(&path, "{\"role\":\"user\",\"content\":\"ok\",\"timestamp\":\"2026-01-01T00:00:00Z\"}\ngarbage\n").unwrap();

        let err = load_transcript(&path).unwrap_err();
        assert!(matches!(err, EngineError::StateCorruption(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn missing_transcript_is_corruption() {
        let err = load_transcript(Path::new("/nonexistent/run.jsonl")).unwrap_err();
        assert!(matches!(err, EngineError::StateCorruption(_)));
    }
}
