//! Bounded pending-job table
//!
//! Tracks queued jobs between publish and terminal result. Every entry
//! carries a deadline (job timeout plus a grace period); the eviction
//! sweep removes entries past it, so memory stays bounded even when a
//! completion notification is lost. Capacity is a hard cap: when the
//! table is full and nothing is evictable, submission is refused, which
//! is the correct backpressure signal for a gateway that is already
//! tracking that much unfinished work.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::core_types::Language;
use crate::errors::CrucibleError;

#[derive(Debug, Clone)]
pub struct PendingJob {
    pub session_id: String,
    pub user_id: String,
    pub language: Language,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

pub struct PendingTracker {
    capacity: usize,
    jobs: Mutex<HashMap<String, PendingJob>>,
}

impl PendingTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(
        &self,
        job_id: &str,
        session_id: &str,
        user_id: &str,
        language: Language,
        timeout_ms: u64,
        grace_ms: u64,
    ) -> Result<(), CrucibleError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().expect("tracker poisoned");
        if jobs.len() >= self.capacity {
            // Make room from expired entries before refusing.
            jobs.retain(|_, job| job.deadline > now);
            if jobs.len() >= self.capacity {
                return Err(CrucibleError::TrackerFull(self.capacity));
            }
        }
        jobs.insert(
            job_id.to_string(),
            PendingJob {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                language,
                submitted_at: now,
                deadline: now + Duration::milliseconds((timeout_ms + grace_ms) as i64),
            },
        );
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<PendingJob> {
        self.jobs
            .lock()
            .expect("tracker poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn remove(&self, job_id: &str) -> Option<PendingJob> {
        self.jobs.lock().expect("tracker poisoned").remove(job_id)
    }

    /// Remove and return every pending job for a session.
    pub fn drain_session(&self, session_id: &str) -> Vec<(String, PendingJob)> {
        let mut jobs = self.jobs.lock().expect("tracker poisoned");
        let ids: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| jobs.remove(&id).map(|job| (id, job)))
            .collect()
    }

    /// Evict entries past their deadline; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().expect("tracker poisoned");
        let before = jobs.len();
        jobs.retain(|_, job| job.deadline > now);
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
