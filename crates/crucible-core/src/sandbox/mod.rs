//! Sandboxed execution of untrusted code
//!
//! One ephemeral, resource-capped, network-isolated environment per job.
//! Routine failures of the submitted program (compile error, non-zero
//! exit, timeout) are encoded in the [`ExecutionResult`]; an `Err` from
//! [`SandboxRunner::execute`] always means the sandbox infrastructure
//! itself failed and the job is a candidate for retry.

use async_trait::async_trait;

use crate::config::LanguageProfile;
use crate::core_types::ExecutionResult;
use crate::errors::SandboxError;

pub mod collector;
pub mod docker;

pub use docker::DockerSandbox;

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run `code` under `profile` with an optional stdin and a hard
    /// wall-clock timeout. The environment and its working area must not
    /// outlive the call, on any exit path.
    async fn execute(
        &self,
        job_id: &str,
        profile: &LanguageProfile,
        code: &str,
        stdin: Option<&str>,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Best-effort forcible termination of the sandbox instances for the
    /// given jobs. Returns how many instances were actually killed.
    async fn kill_jobs(&self, job_ids: &[String]) -> usize;

    /// Liveness of the underlying isolation backend.
    async fn healthy(&self) -> bool;
}
