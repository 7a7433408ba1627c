// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Checkpoint store: point-in-time conversation snapshots that can be saved
//! to disk and restored later.
//!
//! Grounded on `sven-ci`'s JSONL trace export (`write_jsonl_trace`) for the
//! message-framing shape, adapted from an append-only replay log to a single
//! versioned JSON document: a checkpoint is restore-from-snapshot, not
//! replay-from-log, so one file per checkpoint is the right granularity.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use sven_model::Message;

/// `(major, minor)`. Bump `major` for a breaking change to this shape (field
/// removed/retyped); bump `minor` for an additive, backward-compatible one
/// (new optional field).
pub const CHECKPOINT_SCHEMA_VERSION: (u32, u32) = (1, 0);

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("reading checkpoint file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing checkpoint file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing checkpoint JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(
        "checkpoint schema version {found_major}.{found_minor} is incompatible with this \
         build's {expected_major}.{expected_minor} (major version mismatch)"
    )]
    IncompatibleSchema {
        found_major: u32,
        found_minor: u32,
        expected_major: u32,
        expected_minor: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub model: String,
    /// Loop round at which the checkpoint was taken.
    pub turn: u32,
}

/// A single recorded tool execution, kept separately from the message list
/// so a restore can replay side effects without re-running the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub output: String,
    pub is_error: bool,
}

/// A full, restorable conversation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: (u32, u32),
    pub metadata: CheckpointMetadata,
    pub messages: Vec<Message>,
    /// Optional: the tool calls executed since the previous checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_executions: Option<Vec<ToolExecutionRecord>>,
    /// Optional: full contents of files touched since the previous
    /// checkpoint, keyed by path, so a restore can rewrite them on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_snapshots: Option<HashMap<String, String>>,
}

impl Checkpoint {
    pub fn new(session_id: String, model: String, turn: u32, messages: Vec<Message>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            metadata: CheckpointMetadata {
                created_at: Utc::now(),
                session_id,
                model,
                turn,
            },
            messages,
            tool_executions: None,
            file_snapshots: None,
        }
    }

    pub fn with_tool_executions(mut self, records: Vec<ToolExecutionRecord>) -> Self {
        self.tool_executions = Some(records);
        self
    }

    pub fn with_file_snapshots(mut self, snapshots: HashMap<String, String>) -> Self {
        self.file_snapshots = Some(snapshots);
        self
    }

    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| CheckpointError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load a checkpoint, enforcing the schema compatibility policy: a
    /// major-version mismatch is a hard error, a minor-version mismatch is
    /// logged and accepted (the extra/missing fields are additive).
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CheckpointError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw)?;

        let (found_major, found_minor) = checkpoint.schema_version;
        let (expected_major, expected_minor) = CHECKPOINT_SCHEMA_VERSION;
        if found_major != expected_major {
            return Err(CheckpointError::IncompatibleSchema {
                found_major,
                found_minor,
                expected_major,
                expected_minor,
            });
        }
        if found_minor != expected_minor {
            warn!(
                found_major,
                found_minor,
                expected_major,
                expected_minor,
                "checkpoint schema minor version differs from this build; \
                 loading anyway, some fields may be missing or ignored"
            );
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sven_model::Message;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let original = Checkpoint::new(
            "sess-1".into(),
            "gpt-4o".into(),
            3,
            vec![Message::user("hi"), Message::assistant("hello")],
        );
        original.save(&path).unwrap();
        let restored = Checkpoint::load(&path).unwrap();
        assert_eq!(restored.metadata.session_id, "sess-1");
        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.schema_version, CHECKPOINT_SCHEMA_VERSION);
    }

    #[test]
    fn with_tool_executions_and_file_snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut snapshots = HashMap::new();
        snapshots.insert("src/lib.rs".to_string(), "fn main() {}".to_string());
        let original = Checkpoint::new("sess-2".into(), "mock".into(), 1, vec![])
            .with_tool_executions(vec![ToolExecutionRecord {
                call_id: "1".into(),
                tool_name: "read_file".into(),
                args: serde_json::json!({"path": "src/lib.rs"}),
                output: "fn main() {}".into(),
                is_error: false,
            }])
            .with_file_snapshots(snapshots);
        original.save(&path).unwrap();
        let restored = Checkpoint::load(&path).unwrap();
        assert_eq!(restored.tool_executions.unwrap().len(), 1);
        assert_eq!(restored.file_snapshots.unwrap().len(), 1);
    }

    #[test]
    fn major_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint =
            Checkpoint::new("sess-3".into(), "mock".into(), 0, vec![Message::user("hi")]);
        checkpoint.schema_version = (99, 0);
        checkpoint.save(&path).unwrap();
        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::IncompatibleSchema { .. }));
    }

    #[test]
    fn minor_version_mismatch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint =
            Checkpoint::new("sess-4".into(), "mock".into(), 0, vec![Message::user("hi")]);
        checkpoint.schema_version = (CHECKPOINT_SCHEMA_VERSION.0, CHECKPOINT_SCHEMA_VERSION.1 + 1);
        checkpoint.save(&path).unwrap();
        let restored = Checkpoint::load(&path).unwrap();
        assert_eq!(restored.metadata.session_id, "sess-4");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Checkpoint::load(Path::new("/nonexistent/checkpoint.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::Read { .. }));
    }
}
