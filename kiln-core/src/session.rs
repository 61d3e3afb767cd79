//! Session persistence and replay
//!
//! After every completed step the engine appends one JSON file to the
//! current session directory:
//!
//! ```text
//! ./.kiln/sessions/<workflow_name>/<timestamp>/NNNN_<step_name>.json
//! ```
//!
//! Each file carries the step's result and a transcript snapshot, so
//! partial runs stay inspectable and replay can rebuild the exact prefix.
//! Sessions are immutable once written.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::chat::ChatMessage;
use crate::error::{KilnError, Result};
use crate::step::StepResult;

/// Default session root, relative to the working directory
pub const SESSION_ROOT: &str = ".kiln/sessions";

/// Session directory header, written once at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub workflow_name: String,
    /// `workflow_name + target fingerprint + timestamp`
    pub workflow_id: String,
    /// Hash of step names and order, checked before replay
    pub structure_hash: String,
    pub started_at: DateTime<Utc>,
}

/// One persisted step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: StepResult,
    pub transcript_snapshot: Vec<ChatMessage>,
}

/// Hash of the top-level step names in order.
pub fn structure_hash(step_names: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in step_names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Short fingerprint of the resolved target, used in session identifiers.
pub fn target_fingerprint(target: Option<&str>) -> String {
    match target {
        None => "no-target".to_string(),
        Some(target) => {
            let mut hasher = Sha256::new();
            hasher.update(target.as_bytes());
            let digest = format!("{:x}", hasher.finalize());
            digest[..12].to_string()
        }
    }
}

fn sanitize_step_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    sanitized.truncate(60);
    if sanitized.is_empty() {
        sanitized.push_str("step");
    }
    sanitized
}

/// Writes step records into one session directory.
pub struct SessionRecorder {
    dir: PathBuf,
    header: SessionHeader,
    written: AtomicUsize,
}

impl SessionRecorder {
    /// Create a new session directory under `root/<workflow_name>/<timestamp>`.
    pub fn create(
        root: impl AsRef<Path>,
        workflow_name: &str,
        target: Option<&str>,
        structure_hash: String,
    ) -> Result<Self> {
        let started_at = Utc::now();
        let timestamp = started_at.format("%Y%m%dT%H%M%S%3f").to_string();
        let dir = root.as_ref().join(workflow_name).join(&timestamp);
        std::fs::create_dir_all(&dir)?;

        let header = SessionHeader {
            workflow_name: workflow_name.to_string(),
            workflow_id: format!(
                "{}-{}-{}",
                workflow_name,
                target_fingerprint(target),
                timestamp
            ),
            structure_hash,
            started_at,
        };
        std::fs::write(
            dir.join("session.json"),
            serde_json::to_string_pretty(&header)?,
        )?;

        Ok(Self {
            dir,
            header,
            written: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    /// The session identifier (its timestamp directory name).
    pub fn session_id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Persist one step record as its own file.
    pub fn record_step(&self, record: &StepRecord) -> Result<PathBuf> {
        let sequence = self.written.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!(
            "{:04}_{}.json",
            sequence,
            sanitize_step_name(&record.name)
        ));
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(path)
    }
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("dir", &self.dir)
            .finish()
    }
}

/// State reconstructed from a session prefix
#[derive(Debug, Clone)]
pub struct ReplayState {
    /// Output map entries for steps before the resume point
    pub outputs: Vec<(String, Value)>,
    /// Transcript up to (not including) the resume step
    pub transcript: Vec<ChatMessage>,
    /// Index of the step execution resumes from
    pub resume_index: usize,
}

/// Loads persisted sessions and prepares replay state.
pub struct SessionReplayer {
    root: PathBuf,
}

impl SessionReplayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate a session directory: the given id, or the latest for the
    /// workflow.
    pub fn locate(&self, workflow_name: &str, session_id: Option<&str>) -> Result<PathBuf> {
        let workflow_dir = self.root.join(workflow_name);
        if let Some(id) = session_id {
            let dir = workflow_dir.join(id);
            if !dir.is_dir() {
                return Err(KilnError::ReplayMismatch(format!(
                    "session '{}' not found for workflow '{}'",
                    id, workflow_name
                )));
            }
            return Ok(dir);
        }

        // Timestamp directory names sort chronologically.
        let mut sessions: Vec<PathBuf> = std::fs::read_dir(&workflow_dir)
            .map_err(|_| {
                KilnError::ReplayMismatch(format!(
                    "no sessions recorded for workflow '{}'",
                    workflow_name
                ))
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        sessions.sort();
        sessions.pop().ok_or_else(|| {
            KilnError::ReplayMismatch(format!(
                "no sessions recorded for workflow '{}'",
                workflow_name
            ))
        })
    }

    /// Load a session's header and ordered step records.
    pub fn load(&self, dir: &Path) -> Result<(SessionHeader, Vec<StepRecord>)> {
        let header: SessionHeader =
            serde_json::from_str(&std::fs::read_to_string(dir.join("session.json"))?)?;

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().map(|e| e == "json").unwrap_or(false)
                    && path
                        .file_name()
                        .map(|n| n != "session.json")
                        .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut records = Vec::with_capacity(files.len());
        for file in files {
            let record: StepRecord = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            records.push(record);
        }
        Ok((header, records))
    }

    /// Prepare replay state for resuming at `step_name`.
    ///
    /// The session's structure hash must match the current workflow's; the
    /// persisted prefix is cut at the first top-level occurrence of the
    /// target step.
    pub fn prepare(
        &self,
        workflow_name: &str,
        session_id: Option<&str>,
        step_name: &str,
        current_step_names: &[String],
        current_hash: &str,
    ) -> Result<ReplayState> {
        let dir = self.locate(workflow_name, session_id)?;
        let (header, records) = self.load(&dir)?;

        if header.structure_hash != current_hash {
            return Err(KilnError::ReplayMismatch(format!(
                "workflow structure changed since session {} was recorded",
                dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            )));
        }

        let resume_index = current_step_names
            .iter()
            .position(|name| name == step_name)
            .ok_or_else(|| {
                KilnError::ReplayMismatch(format!(
                    "step '{}' does not exist in workflow '{}'",
                    step_name, workflow_name
                ))
            })?;

        let prefix: Vec<&StepRecord> = records
            .iter()
            .filter(|record| record.index < resume_index)
            .collect();

        if prefix.len() < resume_index {
            return Err(KilnError::ReplayMismatch(format!(
                "session only recorded {} of the {} steps before '{}'",
                prefix.len(),
                resume_index,
                step_name
            )));
        }

        let transcript = prefix
            .last()
            .map(|record| record.transcript_snapshot.clone())
            .unwrap_or_default();

        let outputs = prefix
            .iter()
            .map(|record| (record.name.clone(), record.result.value()))
            .collect();

        Ok(ReplayState {
            outputs,
            transcript,
            resume_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(index: usize, name: &str, value: &str, transcript_len: usize) -> StepRecord {
        StepRecord {
            index,
            name: name.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            result: StepResult::from_text(value),
            transcript_snapshot: (0..transcript_len)
                .map(|i| ChatMessage::user(format!("m{}", i)))
                .collect(),
        }
    }

    #[test]
    fn test_structure_hash_orders_matter() {
        let a = structure_hash(&["s1".to_string(), "s2".to_string()]);
        let b = structure_hash(&["s2".to_string(), "s1".to_string()]);
        let c = structure_hash(&["s1".to_string(), "s2".to_string()]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_target_fingerprint() {
        assert_eq!(target_fingerprint(None), "no-target");
        assert_eq!(target_fingerprint(Some("a.rs")), target_fingerprint(Some("a.rs")));
        assert_ne!(target_fingerprint(Some("a.rs")), target_fingerprint(Some("b.rs")));
    }

    #[test]
    fn test_record_and_reload() {
        let root = tempfile::tempdir().unwrap();
        let hash = structure_hash(&["s1".to_string(), "s2".to_string()]);
        let recorder =
            SessionRecorder::create(root.path(), "review", Some("src/"), hash.clone()).unwrap();

        recorder.record_step(&record(0, "s1", "hi\n", 2)).unwrap();
        recorder.record_step(&record(1, "s2", "bye", 4)).unwrap();

        let replayer = SessionReplayer::new(root.path());
        let dir = replayer.locate("review", None).unwrap();
        assert_eq!(dir, recorder.dir());

        let (header, records) = replayer.load(&dir).unwrap();
        assert_eq!(header.workflow_name, "review");
        assert_eq!(header.structure_hash, hash);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "s1");
        assert_eq!(records[1].result.raw_response, "bye");
    }

    #[test]
    fn test_prepare_replay_prefix() {
        let root = tempfile::tempdir().unwrap();
        let names = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let hash = structure_hash(&names);
        let recorder =
            SessionRecorder::create(root.path(), "wf", None, hash.clone()).unwrap();

        recorder.record_step(&record(0, "s1", "one", 2)).unwrap();
        recorder.record_step(&record(1, "s2", "two", 4)).unwrap();
        recorder.record_step(&record(2, "s3", "three", 6)).unwrap();

        let replayer = SessionReplayer::new(root.path());
        let state = replayer.prepare("wf", None, "s3", &names, &hash).unwrap();

        assert_eq!(state.resume_index, 2);
        assert_eq!(state.outputs.len(), 2);
        assert_eq!(state.outputs[0], ("s1".to_string(), json!("one")));
        // Transcript comes from the last step before the resume point.
        assert_eq!(state.transcript.len(), 4);
    }

    #[test]
    fn test_prepare_rejects_structure_mismatch() {
        let root = tempfile::tempdir().unwrap();
        let recorded_names = vec!["s1".to_string(), "s2".to_string()];
        let recorder = SessionRecorder::create(
            root.path(),
            "wf",
            None,
            structure_hash(&recorded_names),
        )
        .unwrap();
        recorder.record_step(&record(0, "s1", "one", 1)).unwrap();

        let current_names = vec!["s1".to_string(), "renamed".to_string()];
        let replayer = SessionReplayer::new(root.path());
        let err = replayer
            .prepare(
                "wf",
                None,
                "renamed",
                &current_names,
                &structure_hash(&current_names),
            )
            .unwrap_err();
        assert!(matches!(err, KilnError::ReplayMismatch(_)));
    }

    #[test]
    fn test_prepare_rejects_missing_prefix() {
        let root = tempfile::tempdir().unwrap();
        let names = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let hash = structure_hash(&names);
        let recorder = SessionRecorder::create(root.path(), "wf", None, hash.clone()).unwrap();
        // Only the first step ever ran.
        recorder.record_step(&record(0, "s1", "one", 1)).unwrap();

        let replayer = SessionReplayer::new(root.path());
        assert!(replayer.prepare("wf", None, "s3", &names, &hash).is_err());
        // Resuming right after the recorded prefix works.
        assert!(replayer.prepare("wf", None, "s2", &names, &hash).is_ok());
    }

    #[test]
    fn test_locate_missing_session() {
        let root = tempfile::tempdir().unwrap();
        let replayer = SessionReplayer::new(root.path());
        assert!(replayer.locate("ghost", None).is_err());
        assert!(replayer.locate("ghost", Some("20240101T000000000")).is_err());
    }

    #[test]
    fn test_sanitize_step_name() {
        assert_eq!(sanitize_step_name("simple"), "simple");
        assert_eq!(sanitize_step_name("echo hi"), "echo_hi");
        let long = "x".repeat(100);
        assert_eq!(sanitize_step_name(&long).len(), 60);
        assert_eq!(sanitize_step_name(""), "step");
    }
}
