//! Hierarchical configuration for the execution pipeline
//!
//! Follows a layered approach: compiled-in defaults cover a working local
//! setup, a YAML file overrides them, and a handful of environment
//! variables override the file for container deployments. The language
//! profile table lives here and is immutable for the process lifetime.

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{
    AdmissionConfig, CrucibleConfig, InputLimits, LanguageProfile, LanguageRegistry, QueueConfig,
    SandboxConfig, TrackerConfig,
};
