//! Shared value types flowing through the execution pipeline
//!
//! Everything here crosses a component boundary: jobs cross the queue,
//! results cross from the sandbox into the store, records come back out for
//! status polling. All of it is serde-serializable because the queue journal
//! and the durable log are JSON on disk, and malformed payloads must fail at
//! deserialization time rather than inside business logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::CrucibleError;

/// Closed set of supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Java,
    Cpp,
    C,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Javascript,
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::C,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "javascript" | "node" | "nodejs" => Ok(Language::Javascript),
            "python" | "python3" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "go" | "golang" => Ok(Language::Go),
            "rust" => Ok(Language::Rust),
            other => Err(CrucibleError::UnsupportedLanguage {
                requested: other.to_string(),
                supported: Language::ALL.iter().map(|l| l.to_string()).collect(),
            }),
        }
    }
}

/// One code-execution request, tracked from submission to terminal result.
///
/// This is the exact shape published to the job queue; missing required
/// fields are a deserialization error and the message is rejected without
/// requeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub language: Language,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

/// Terminal condition of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Termination {
    Success,
    /// Non-zero exit, which covers both runtime failures and compile
    /// failures (the compile step runs inside the same invocation).
    RuntimeError { exit_code: i64 },
    Timeout,
}

/// Output of one completed sandbox run. Append-only once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub termination: Termination,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.termination, Termination::Success)
    }
}

/// Retry metadata carried alongside a queued message.
///
/// Incremented on each republish; once `retry_count` exceeds the configured
/// maximum the message is dead-lettered instead of retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub first_enqueued_at: DateTime<Utc>,
}

impl RetryEnvelope {
    pub fn new() -> Self {
        Self {
            retry_count: 0,
            last_error: None,
            first_enqueued_at: Utc::now(),
        }
    }

    /// Envelope for the next redelivery attempt after `error`.
    pub fn next_attempt(&self, error: impl Into<String>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(error.into()),
            first_enqueued_at: self.first_enqueued_at,
        }
    }
}

impl Default for RetryEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome of a job as persisted in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
}

/// Durable log record keyed by job id, written exactly once per job and
/// read back for status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub language: Language,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One entry in a session's append-only execution history.
///
/// History is appended in completion order, not submission order;
/// concurrent submissions to the same session may land out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: String,
    pub user_id: String,
    pub language: Language,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub executed_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_result(job: &Job, result: &ExecutionResult) -> Self {
        Self {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            language: job.language,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            execution_time_ms: result.execution_time_ms,
            timed_out: result.timed_out,
            executed_at: Utc::now(),
        }
    }
}

/// "Job completed" notification handed to the (external) real-time layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub job_id: String,
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub outcome: JobOutcome,
    pub timed_out: bool,
    pub execution_time_ms: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Permission tiers on a session, lowest to highest. Execution requires
/// [`PermissionLevel::Write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parses_aliases_and_rejects_unknown() {
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("NODE".parse::<Language>().unwrap(), Language::Javascript);
        assert_eq!("golang".parse::<Language>().unwrap(), Language::Go);

        let err = "cobol".parse::<Language>().unwrap_err();
        match err {
            CrucibleError::UnsupportedLanguage { supported, .. } => {
                assert_eq!(supported.len(), Language::ALL.len());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn job_round_trips_and_rejects_missing_fields() {
        let job = Job {
            job_id: "j-1".into(),
            request_id: "r-1".into(),
            session_id: "s-1".into(),
            user_id: "u-1".into(),
            language: Language::Python,
            code: "print('hi')".into(),
            stdin: None,
            timeout_ms: Some(2000),
            submitted_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&job).unwrap();
        let back: Job = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.job_id, "j-1");
        assert_eq!(back.language, Language::Python);

        // A payload without a session id must not deserialize.
        let malformed = serde_json::json!({
            "job_id": "j-2",
            "request_id": "r-2",
            "user_id": "u-1",
            "language": "python",
            "code": "print(1)",
            "submitted_at": Utc::now(),
        });
        assert!(serde_json::from_value::<Job>(malformed).is_err());
    }

    #[test]
    fn retry_envelope_increments_and_keeps_first_enqueue_time() {
        let first = RetryEnvelope::new();
        let second = first.next_attempt("docker down");
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.first_enqueued_at, first.first_enqueued_at);
        assert_eq!(second.last_error.as_deref(), Some("docker down"));
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Admin);
    }
}
