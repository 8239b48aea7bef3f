//! Execution gateway
//!
//! Front door for code execution. Validates and authorizes a submission,
//! asks the admission policy whether to run it inline or enqueue it, and
//! serves status polling, session kill, and the language catalog. The
//! gateway never touches Docker directly; everything goes through the
//! [`SandboxRunner`] and [`JobQueue`] seams so the HTTP layer and tests
//! can wire in whatever implementations they need.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::{AdmissionPolicy, Decision};
use crate::config::{InputLimits, LanguageRegistry, TrackerConfig};
use crate::core_types::{
    ExecutionResult, HistoryEntry, Job, JobOutcome, JobRecord, Language, PermissionLevel,
    RetryEnvelope,
};
use crate::errors::CrucibleError;
use crate::queue::{JobQueue, CODE_EXECUTION_QUEUE};
use crate::sandbox::SandboxRunner;
use crate::store::{ResultStore, SessionDirectory};
use crate::tracker::PendingTracker;

/// One execution submission as received at the boundary.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// What the gateway did with a submission.
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    /// Ran inline; the result is final.
    Sync {
        job_id: String,
        result: ExecutionResult,
    },
    /// Enqueued; poll the status endpoint with the job id.
    Queued { job_id: String },
}

/// Answer to a status poll, scoped to the submitting user.
#[derive(Debug, Clone)]
pub enum JobStatus {
    Pending {
        language: Language,
        submitted_at: chrono::DateTime<Utc>,
    },
    Completed { result: ExecutionResult },
    Failed { error: String },
    NotFound,
}

/// Outcome of a best-effort session kill.
#[derive(Debug, Clone, Copy)]
pub struct KillReport {
    pub pending: usize,
    pub killed: usize,
}

/// Catalog entry for the languages endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LanguageSummary {
    pub language: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayStats {
    pub pending_jobs: usize,
    pub queue_ready: usize,
    pub queue_in_flight: usize,
}

pub struct ExecutionGateway {
    policy: AdmissionPolicy,
    limits: InputLimits,
    tracker_config: TrackerConfig,
    registry: Arc<LanguageRegistry>,
    queue: Arc<dyn JobQueue>,
    sandbox: Arc<dyn SandboxRunner>,
    sessions: Arc<dyn SessionDirectory>,
    store: Arc<dyn ResultStore>,
    tracker: Arc<PendingTracker>,
}

impl ExecutionGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: AdmissionPolicy,
        limits: InputLimits,
        tracker_config: TrackerConfig,
        registry: Arc<LanguageRegistry>,
        queue: Arc<dyn JobQueue>,
        sandbox: Arc<dyn SandboxRunner>,
        sessions: Arc<dyn SessionDirectory>,
        store: Arc<dyn ResultStore>,
        tracker: Arc<PendingTracker>,
    ) -> Self {
        Self {
            policy,
            limits,
            tracker_config,
            registry,
            queue,
            sandbox,
            sessions,
            store,
            tracker,
        }
    }

    /// Validate, authorize, and either run or enqueue a submission.
    pub async fn submit(&self, req: ExecuteRequest) -> Result<SubmissionOutcome, CrucibleError> {
        self.check_limits(&req)?;

        let language: Language = req.language.parse()?;
        let Some(profile) = self.registry.get(language) else {
            return Err(CrucibleError::UnsupportedLanguage {
                requested: req.language.clone(),
                supported: self.registry.supported_tags(),
            });
        };

        if !self.sessions.session_exists(&req.session_id).await? {
            return Err(CrucibleError::SessionNotFound(req.session_id.clone()));
        }
        if !self
            .sessions
            .has_permission(&req.session_id, &req.user_id, PermissionLevel::Write)
            .await?
        {
            return Err(CrucibleError::AccessDenied(format!(
                "user {} may not execute code on session {}",
                req.user_id, req.session_id
            )));
        }

        let timeout_ms = req
            .timeout_ms
            .unwrap_or(profile.default_timeout_ms)
            .min(profile.max_timeout_ms);

        let job_id = Uuid::new_v4().to_string();
        let job = Job {
            job_id: job_id.clone(),
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            user_id: req.user_id.clone(),
            language,
            code: req.code.clone(),
            stdin: req.stdin.clone(),
            timeout_ms: Some(timeout_ms),
            submitted_at: Utc::now(),
        };

        match self.policy.decide(language, req.code.len(), timeout_ms) {
            Decision::Sync => self.run_inline(job, timeout_ms).await,
            Decision::Queued => self.enqueue(job, timeout_ms).await,
        }
    }

    async fn run_inline(
        &self,
        job: Job,
        timeout_ms: u64,
    ) -> Result<SubmissionOutcome, CrucibleError> {
        // Tracked while running so a session kill can reach inline jobs too.
        self.tracker.insert(
            &job.job_id,
            &job.session_id,
            &job.user_id,
            job.language,
            timeout_ms,
            self.tracker_config.grace_ms,
        )?;

        // Profile presence was checked in submit.
        let profile = self
            .registry
            .get(job.language)
            .ok_or_else(|| CrucibleError::ConfigError(format!("no profile for {}", job.language)))?;

        log::info!(
            "running job {} inline (session={}, language={})",
            job.job_id,
            job.session_id,
            job.language
        );

        let outcome = self
            .sandbox
            .execute(
                &job.job_id,
                profile,
                &job.code,
                job.stdin.as_deref(),
                timeout_ms,
            )
            .await;
        self.tracker.remove(&job.job_id);
        let result = outcome?;

        // Persist so status polling and session history see inline runs too.
        let record = JobRecord {
            job_id: job.job_id.clone(),
            request_id: job.request_id.clone(),
            session_id: job.session_id.clone(),
            user_id: job.user_id.clone(),
            language: job.language,
            outcome: JobOutcome::Completed,
            result: Some(result.clone()),
            error: None,
            recorded_at: Utc::now(),
        };
        if self.store.record_job(record).await? {
            self.store
                .append_history(&job.session_id, HistoryEntry::from_result(&job, &result))
                .await?;
        }

        Ok(SubmissionOutcome::Sync {
            job_id: job.job_id,
            result,
        })
    }

    async fn enqueue(&self, job: Job, timeout_ms: u64) -> Result<SubmissionOutcome, CrucibleError> {
        self.tracker.insert(
            &job.job_id,
            &job.session_id,
            &job.user_id,
            job.language,
            timeout_ms,
            self.tracker_config.grace_ms,
        )?;

        let payload = serde_json::to_value(&job)?;
        if let Err(e) = self
            .queue
            .publish(CODE_EXECUTION_QUEUE, payload, RetryEnvelope::new())
            .await
        {
            // Do not leave a pending entry for a job that never made it in.
            self.tracker.remove(&job.job_id);
            return Err(e);
        }

        log::info!(
            "queued job {} (session={}, language={})",
            job.job_id,
            job.session_id,
            job.language
        );
        Ok(SubmissionOutcome::Queued { job_id: job.job_id })
    }

    fn check_limits(&self, req: &ExecuteRequest) -> Result<(), CrucibleError> {
        if req.code.trim().is_empty() {
            return Err(CrucibleError::InvalidInput("code must not be empty".into()));
        }
        if req.code.len() > self.limits.max_code_bytes {
            return Err(CrucibleError::InvalidInput(format!(
                "code exceeds {} bytes",
                self.limits.max_code_bytes
            )));
        }
        if let Some(stdin) = &req.stdin {
            if stdin.len() > self.limits.max_stdin_bytes {
                return Err(CrucibleError::InvalidInput(format!(
                    "stdin exceeds {} bytes",
                    self.limits.max_stdin_bytes
                )));
            }
        }
        if let Some(timeout_ms) = req.timeout_ms {
            if timeout_ms < self.limits.min_timeout_ms || timeout_ms > self.limits.max_timeout_ms {
                return Err(CrucibleError::InvalidInput(format!(
                    "timeout must be between {}ms and {}ms",
                    self.limits.min_timeout_ms, self.limits.max_timeout_ms
                )));
            }
        }
        Ok(())
    }

    /// Status of a job, visible only to the user who submitted it. Jobs
    /// belonging to other users read as not found rather than denied, so
    /// the endpoint does not leak which ids exist.
    pub async fn status(&self, job_id: &str, user_id: &str) -> Result<JobStatus, CrucibleError> {
        if let Some(record) = self.store.fetch_job(job_id).await? {
            if record.user_id != user_id {
                return Ok(JobStatus::NotFound);
            }
            // A terminal record supersedes the pending entry; the worker
            // runs in its own process, so this observation is where the
            // gateway learns the job finished.
            self.tracker.remove(job_id);
            return Ok(match record.outcome {
                JobOutcome::Completed => match record.result {
                    Some(result) => JobStatus::Completed { result },
                    None => JobStatus::Failed {
                        error: "result missing from record".into(),
                    },
                },
                JobOutcome::Failed => JobStatus::Failed {
                    error: record
                        .error
                        .unwrap_or_else(|| "execution failed".into()),
                },
            });
        }

        match self.tracker.get(job_id) {
            Some(pending) if pending.user_id == user_id => Ok(JobStatus::Pending {
                language: pending.language,
                submitted_at: pending.submitted_at,
            }),
            _ => Ok(JobStatus::NotFound),
        }
    }

    /// Best-effort kill of everything pending for a session. Containers
    /// that already exited are simply not there to remove.
    pub async fn kill_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<KillReport, CrucibleError> {
        if !self.sessions.session_exists(session_id).await? {
            return Err(CrucibleError::SessionNotFound(session_id.to_string()));
        }
        if !self
            .sessions
            .has_permission(session_id, user_id, PermissionLevel::Write)
            .await?
        {
            return Err(CrucibleError::AccessDenied(format!(
                "user {user_id} may not kill session {session_id}"
            )));
        }

        let drained = self.tracker.drain_session(session_id);
        let job_ids: Vec<String> = drained.into_iter().map(|(id, _)| id).collect();
        let killed = self.sandbox.kill_jobs(&job_ids).await;
        log::info!(
            "kill for session {session_id}: {} pending, {} containers removed",
            job_ids.len(),
            killed
        );
        Ok(KillReport {
            pending: job_ids.len(),
            killed,
        })
    }

    pub fn languages(&self) -> Vec<LanguageSummary> {
        self.registry
            .supported()
            .into_iter()
            .filter_map(|language| self.registry.get(language))
            .map(|profile| LanguageSummary {
                language: profile.language.to_string(),
                default_timeout_ms: profile.default_timeout_ms,
                max_timeout_ms: profile.max_timeout_ms,
            })
            .collect()
    }

    pub async fn healthy(&self) -> bool {
        self.sandbox.healthy().await
    }

    pub async fn stats(&self) -> Result<GatewayStats, CrucibleError> {
        let depth = self.queue.depth(CODE_EXECUTION_QUEUE).await?;
        Ok(GatewayStats {
            pending_jobs: self.tracker.len(),
            queue_ready: depth.ready,
            queue_in_flight: depth.in_flight,
        })
    }

    /// Periodically evict tracker entries whose deadline passed without a
    /// terminal record, until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let gateway = Arc::clone(self);
        let interval = std::time::Duration::from_millis(gateway.tracker_config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = gateway.tracker.sweep();
                        if evicted > 0 {
                            log::info!("tracker sweep evicted {evicted} stale entries");
                        }
                    }
                }
            }
        });
    }
}
