//! Synchronous-vs-queued admission decision
//!
//! A pure function over (language, code size, effective timeout). Inline
//! execution is only worth it when the worst case is small: a fast
//! interpreter, a trivial amount of code, and a short timeout. Everything
//! else goes through the queue so slow or large jobs cannot stall request
//! handling.

use crate::config::AdmissionConfig;
use crate::core_types::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run inline on the request path and answer with the result.
    Sync,
    /// Publish to the job queue and answer with a job id.
    Queued,
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    config: AdmissionConfig,
}

impl AdmissionPolicy {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    /// Decide how a job runs. `effective_timeout_ms` is the requested
    /// timeout or, absent one, the language profile's default.
    pub fn decide(
        &self,
        language: Language,
        code_len: usize,
        effective_timeout_ms: u64,
    ) -> Decision {
        let fast = self.config.fast_languages.contains(&language);
        if fast
            && code_len <= self.config.max_sync_code_bytes
            && effective_timeout_ms <= self.config.max_sync_timeout_ms
        {
            Decision::Sync
        } else {
            Decision::Queued
        }
    }
}
