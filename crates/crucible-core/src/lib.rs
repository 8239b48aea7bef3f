//! Crucible core: sandboxed code execution and job dispatch
//!
//! The pipeline in one sentence: a submission enters through the
//! [`gateway::ExecutionGateway`], the [`admission::AdmissionPolicy`]
//! decides between an inline run and the durable [`queue`], a
//! [`worker::Worker`] drains the queue into the Docker-backed
//! [`sandbox`], and terminal results land in the [`store`] where status
//! polling finds them. The binaries in the sibling crates are thin
//! wiring around these pieces.

pub mod admission;
pub mod config;
pub mod core_types;
pub mod errors;
pub mod gateway;
pub mod queue;
pub mod sandbox;
pub mod store;
pub mod tracker;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use admission::{AdmissionPolicy, Decision};
pub use config::{ConfigLoader, CrucibleConfig, LanguageProfile, LanguageRegistry};
pub use core_types::{
    CompletionNotice, ExecutionResult, HistoryEntry, Job, JobOutcome, JobRecord, Language,
    PermissionLevel, RetryEnvelope, Termination,
};
pub use errors::{CrucibleError, SandboxError};
pub use gateway::{
    ExecuteRequest, ExecutionGateway, GatewayStats, JobStatus, KillReport, LanguageSummary,
    SubmissionOutcome,
};
pub use queue::{
    standard_topology, Delivery, DurableQueue, JobQueue, QueueConsumer, QueueDepth, QueueSpec,
    QueuedMessage, CODE_EXECUTION_DLQ, CODE_EXECUTION_QUEUE, NOTIFICATIONS_QUEUE,
};
pub use sandbox::{DockerSandbox, SandboxRunner};
pub use store::{
    FileResultStore, InMemoryResultStore, InMemorySessions, PermissiveSessions, ResultStore,
    SessionDirectory,
};
pub use tracker::{PendingJob, PendingTracker};
pub use worker::{Worker, WorkerConfig};
