//! Persistence and authorization seams
//!
//! Session CRUD and token verification live in an external collaborator;
//! the pipeline only asks two questions of it (does the session exist, and
//! may this user act at this level) through [`SessionDirectory`]. Results
//! go through [`ResultStore`]: a durable log record keyed by job id for
//! status polling, plus the session's append-only execution history.
//! `record_job` is first-write-wins so queue redelivery can never
//! duplicate a persisted result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::core_types::{HistoryEntry, JobRecord, PermissionLevel};
use crate::errors::CrucibleError;

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn session_exists(&self, session_id: &str) -> Result<bool, CrucibleError>;

    /// Owner holds every level; participants hold their assigned level
    /// and everything below it.
    async fn has_permission(
        &self,
        session_id: &str,
        user_id: &str,
        level: PermissionLevel,
    ) -> Result<bool, CrucibleError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist the terminal record for a job. Returns `false` (and writes
    /// nothing) when a record for this job id already exists.
    async fn record_job(&self, record: JobRecord) -> Result<bool, CrucibleError>;

    async fn fetch_job(&self, job_id: &str) -> Result<Option<JobRecord>, CrucibleError>;

    /// Append to the session's execution history, in completion order.
    async fn append_history(
        &self,
        session_id: &str,
        entry: HistoryEntry,
    ) -> Result<(), CrucibleError>;

    /// Most recent `limit` entries, newest first.
    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, CrucibleError>;
}

/// In-memory session table, sufficient for tests and single-process
/// deployments where the real session service is not wired in.
#[derive(Default)]
pub struct InMemorySessions {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

struct SessionEntry {
    owner: String,
    participants: HashMap<String, PermissionLevel>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session_id: &str, owner: &str) {
        self.sessions.lock().expect("session table poisoned").insert(
            session_id.to_string(),
            SessionEntry {
                owner: owner.to_string(),
                participants: HashMap::new(),
            },
        );
    }

    pub fn add_participant(&self, session_id: &str, user_id: &str, level: PermissionLevel) {
        if let Some(entry) = self
            .sessions
            .lock()
            .expect("session table poisoned")
            .get_mut(session_id)
        {
            entry.participants.insert(user_id.to_string(), level);
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .remove(session_id);
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessions {
    async fn session_exists(&self, session_id: &str) -> Result<bool, CrucibleError> {
        Ok(self
            .sessions
            .lock()
            .expect("session table poisoned")
            .contains_key(session_id))
    }

    async fn has_permission(
        &self,
        session_id: &str,
        user_id: &str,
        level: PermissionLevel,
    ) -> Result<bool, CrucibleError> {
        let sessions = self.sessions.lock().expect("session table poisoned");
        let Some(entry) = sessions.get(session_id) else {
            return Ok(false);
        };
        if entry.owner == user_id {
            return Ok(true);
        }
        Ok(entry
            .participants
            .get(user_id)
            .is_some_and(|granted| *granted >= level))
    }
}

/// Stand-in for deployments where the real session service is not wired
/// in: every session exists and every user may act. The worker's
/// re-authorization check becomes vacuous under this directory, so it is
/// only suitable behind a boundary that does its own access control.
pub struct PermissiveSessions;

#[async_trait]
impl SessionDirectory for PermissiveSessions {
    async fn session_exists(&self, _session_id: &str) -> Result<bool, CrucibleError> {
        Ok(true)
    }

    async fn has_permission(
        &self,
        _session_id: &str,
        _user_id: &str,
        _level: PermissionLevel,
    ) -> Result<bool, CrucibleError> {
        Ok(true)
    }
}

/// In-memory result store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryResultStore {
    records: Mutex<HashMap<String, JobRecord>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn record_job(&self, record: JobRecord) -> Result<bool, CrucibleError> {
        let mut records = self.records.lock().expect("record table poisoned");
        if records.contains_key(&record.job_id) {
            return Ok(false);
        }
        records.insert(record.job_id.clone(), record);
        Ok(true)
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<JobRecord>, CrucibleError> {
        Ok(self
            .records
            .lock()
            .expect("record table poisoned")
            .get(job_id)
            .cloned())
    }

    async fn append_history(
        &self,
        session_id: &str,
        entry: HistoryEntry,
    ) -> Result<(), CrucibleError> {
        self.history
            .lock()
            .expect("history table poisoned")
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, CrucibleError> {
        let history = self.history.lock().expect("history table poisoned");
        let entries = history.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

/// File-backed result store: one JSON file per job record under
/// `records/`, one JSON-lines file per session under `history/`. Lets the
/// gateway and worker processes share terminal state through the
/// filesystem, the same way they share the queue journal.
pub struct FileResultStore {
    records_dir: PathBuf,
    history_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileResultStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CrucibleError> {
        let root = root.into();
        let records_dir = root.join("records");
        let history_dir = root.join("history");
        tokio::fs::create_dir_all(&records_dir).await?;
        tokio::fs::create_dir_all(&history_dir).await?;
        Ok(Self {
            records_dir,
            history_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.records_dir.join(format!("{job_id}.json"))
    }

    fn history_path(&self, session_id: &str) -> PathBuf {
        self.history_dir.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn record_job(&self, record: JobRecord) -> Result<bool, CrucibleError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(&record.job_id);
        // First write wins: create_new refuses an existing record.
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec_pretty(&record)?).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<JobRecord>, CrucibleError> {
        match tokio::fs::read(self.record_path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_history(
        &self,
        session_id: &str,
        entry: HistoryEntry,
    ) -> Result<(), CrucibleError> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(session_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, CrucibleError> {
        let raw = match tokio::fs::read_to_string(self.history_path(session_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in raw.lines().rev().take(limit) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{JobOutcome, Language};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(job_id: &str) -> JobRecord {
        JobRecord {
            job_id: job_id.to_string(),
            request_id: "r-1".into(),
            session_id: "s-1".into(),
            user_id: "u-1".into(),
            language: Language::Python,
            outcome: JobOutcome::Completed,
            result: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    fn entry(job_id: &str) -> HistoryEntry {
        HistoryEntry {
            job_id: job_id.to_string(),
            user_id: "u-1".into(),
            language: Language::Python,
            stdout: "hi\n".into(),
            stderr: String::new(),
            execution_time_ms: 12,
            timed_out: false,
            executed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn permission_hierarchy() {
        let sessions = InMemorySessions::new();
        sessions.add_session("s-1", "owner");
        sessions.add_participant("s-1", "editor", PermissionLevel::Write);
        sessions.add_participant("s-1", "viewer", PermissionLevel::Read);

        let can = |u: &'static str, l| {
            let s = &sessions;
            async move { s.has_permission("s-1", u, l).await.unwrap() }
        };
        assert!(can("owner", PermissionLevel::Admin).await);
        assert!(can("editor", PermissionLevel::Write).await);
        assert!(can("editor", PermissionLevel::Read).await);
        assert!(!can("editor", PermissionLevel::Admin).await);
        assert!(!can("viewer", PermissionLevel::Write).await);
        assert!(!can("stranger", PermissionLevel::Read).await);
        assert!(!sessions.session_exists("s-2").await.unwrap());
    }

    #[tokio::test]
    async fn record_job_is_first_write_wins() {
        let store = InMemoryResultStore::new();
        assert!(store.record_job(record("j-1")).await.unwrap());
        assert!(!store.record_job(record("j-1")).await.unwrap());
        assert!(store.fetch_job("j-1").await.unwrap().is_some());
        assert!(store.fetch_job("j-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_dedups() {
        let dir = tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();

        assert!(store.record_job(record("j-1")).await.unwrap());
        assert!(!store.record_job(record("j-1")).await.unwrap());
        let fetched = store.fetch_job("j-1").await.unwrap().unwrap();
        assert_eq!(fetched.outcome, JobOutcome::Completed);

        store.append_history("s-1", entry("j-1")).await.unwrap();
        store.append_history("s-1", entry("j-2")).await.unwrap();
        let recent = store.history("s-1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first.
        assert_eq!(recent[0].job_id, "j-2");

        assert!(store.history("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_in_completion_order() {
        let store = InMemoryResultStore::new();
        store.append_history("s-1", entry("j-2")).await.unwrap();
        store.append_history("s-1", entry("j-1")).await.unwrap();
        let recent = store.history("s-1", 1).await.unwrap();
        assert_eq!(recent[0].job_id, "j-1");
    }
}
