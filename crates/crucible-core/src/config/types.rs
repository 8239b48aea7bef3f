//! Configuration type definitions
//!
//! Every section carries serde defaults so a minimal (or empty) YAML file
//! yields a runnable configuration. The built-in language table mirrors the
//! seven supported runtimes; deployments can narrow or retune it but the
//! set of language tags is closed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::core_types::Language;
use crate::errors::CrucibleError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrucibleConfig {
    /// Root directory for the queue journal and the durable result log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub limits: InputLimits,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Language profile table; defaults to the built-in seven-language set.
    #[serde(default = "LanguageProfile::builtin_table")]
    pub languages: Vec<LanguageProfile>,
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            admission: AdmissionConfig::default(),
            limits: InputLimits::default(),
            sandbox: SandboxConfig::default(),
            queue: QueueConfig::default(),
            tracker: TrackerConfig::default(),
            languages: LanguageProfile::builtin_table(),
        }
    }
}

impl CrucibleConfig {
    pub fn validate(&self) -> Result<(), CrucibleError> {
        if self.languages.is_empty() {
            return Err(CrucibleError::ConfigError(
                "language table must not be empty".into(),
            ));
        }
        let mut seen = HashMap::new();
        for profile in &self.languages {
            if seen.insert(profile.language, ()).is_some() {
                return Err(CrucibleError::ConfigError(format!(
                    "duplicate language profile for '{}'",
                    profile.language
                )));
            }
            if profile.default_timeout_ms == 0 || profile.default_timeout_ms > profile.max_timeout_ms
            {
                return Err(CrucibleError::ConfigError(format!(
                    "'{}': default timeout must be in 1..=max timeout",
                    profile.language
                )));
            }
            if profile.command.trim().is_empty() || profile.filename.trim().is_empty() {
                return Err(CrucibleError::ConfigError(format!(
                    "'{}': command and filename are required",
                    profile.language
                )));
            }
        }
        for fast in &self.admission.fast_languages {
            if !seen.contains_key(fast) {
                return Err(CrucibleError::ConfigError(format!(
                    "admission fast language '{fast}' has no profile"
                )));
            }
        }
        if self.limits.min_timeout_ms == 0 || self.limits.min_timeout_ms > self.limits.max_timeout_ms
        {
            return Err(CrucibleError::ConfigError(
                "timeout bounds must satisfy 1 <= min <= max".into(),
            ));
        }
        if self.queue.backoff_base_ms == 0 || self.queue.backoff_base_ms > self.queue.backoff_cap_ms
        {
            return Err(CrucibleError::ConfigError(
                "retry backoff base must be in 1..=cap".into(),
            ));
        }
        if self.tracker.capacity == 0 {
            return Err(CrucibleError::ConfigError(
                "tracker capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn language_registry(&self) -> LanguageRegistry {
        LanguageRegistry::new(self.languages.clone())
    }
}

/// Thresholds for the synchronous-vs-queued admission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_fast_languages")]
    pub fast_languages: Vec<Language>,
    #[serde(default = "default_max_sync_code_bytes")]
    pub max_sync_code_bytes: usize,
    #[serde(default = "default_max_sync_timeout_ms")]
    pub max_sync_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fast_languages: default_fast_languages(),
            max_sync_code_bytes: default_max_sync_code_bytes(),
            max_sync_timeout_ms: default_max_sync_timeout_ms(),
        }
    }
}

/// Hard bounds applied to every submission before anything is allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLimits {
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_code_bytes: default_max_code_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

/// Resource caps applied to every sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,
    #[serde(default = "default_tmpfs_size_mb")]
    pub tmpfs_size_mb: u64,
    /// Per-stream cap on captured output; excess is dropped with a marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Pull all profile images at startup rather than on first use.
    #[serde(default)]
    pub pull_images_on_start: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory_bytes(),
            cpu_shares: default_cpu_shares(),
            tmpfs_size_mb: default_tmpfs_size_mb(),
            max_output_bytes: default_max_output_bytes(),
            pull_images_on_start: false,
        }
    }
}

/// Queue topology tuning: TTLs, retry budget, backoff shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: u64,
    #[serde(default = "default_notification_ttl_ms")]
    pub notification_ttl_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_ttl_ms: default_message_ttl_ms(),
            notification_ttl_ms: default_notification_ttl_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Bounds on the in-memory pending-job table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_capacity")]
    pub capacity: usize,
    /// Added to a job's timeout to form its tracker deadline.
    #[serde(default = "default_tracker_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: default_tracker_capacity(),
            grace_ms: default_tracker_grace_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Static per-language execution profile: which image to run, where the
/// source lands, and how it is invoked. The command is a single shell line
/// so compile-and-run languages work the same way as run-only ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    pub image: String,
    pub filename: String,
    pub command: String,
    #[serde(default = "default_profile_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_profile_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

impl LanguageProfile {
    pub fn builtin_table() -> Vec<LanguageProfile> {
        fn profile(
            language: Language,
            image: &str,
            filename: &str,
            command: &str,
            default_timeout_ms: u64,
        ) -> LanguageProfile {
            LanguageProfile {
                language,
                image: image.to_string(),
                filename: filename.to_string(),
                command: command.to_string(),
                default_timeout_ms,
                max_timeout_ms: default_timeout_ms * 2,
            }
        }

        vec![
            profile(
                Language::Javascript,
                "node:18-alpine",
                "code.js",
                "node code.js",
                30_000,
            ),
            profile(
                Language::Python,
                "python:3.11-alpine",
                "code.py",
                "python code.py",
                30_000,
            ),
            profile(
                Language::Java,
                "openjdk:17-alpine",
                "Main.java",
                "javac Main.java && java Main",
                45_000,
            ),
            profile(
                Language::Cpp,
                "gcc:alpine",
                "code.cpp",
                "g++ -o code code.cpp && ./code",
                45_000,
            ),
            profile(
                Language::C,
                "gcc:alpine",
                "code.c",
                "gcc -o code code.c && ./code",
                45_000,
            ),
            profile(
                Language::Go,
                "golang:alpine",
                "main.go",
                "go run main.go",
                30_000,
            ),
            profile(
                Language::Rust,
                "rust:alpine",
                "main.rs",
                "rustc main.rs && ./main",
                45_000,
            ),
        ]
    }
}

/// Read-only lookup table over the configured language profiles.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn new(profiles: Vec<LanguageProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(LanguageProfile::builtin_table())
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    pub fn supported(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.profiles.keys().copied().collect();
        langs.sort_by_key(|l| l.as_str());
        langs
    }

    pub fn supported_tags(&self) -> Vec<String> {
        self.supported().iter().map(|l| l.to_string()).collect()
    }

    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> =
            self.profiles.values().map(|p| p.image.clone()).collect();
        images.sort();
        images.dedup();
        images
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_fast_languages() -> Vec<Language> {
    vec![Language::Javascript, Language::Python]
}

fn default_max_sync_code_bytes() -> usize {
    1_000
}

fn default_max_sync_timeout_ms() -> u64 {
    10_000
}

fn default_max_code_bytes() -> usize {
    64 * 1024
}

fn default_max_stdin_bytes() -> usize {
    16 * 1024
}

fn default_min_timeout_ms() -> u64 {
    1
}

fn default_max_timeout_ms() -> u64 {
    120_000
}

fn default_memory_bytes() -> i64 {
    128 * 1024 * 1024
}

fn default_cpu_shares() -> i64 {
    512
}

fn default_tmpfs_size_mb() -> u64 {
    50
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_message_ttl_ms() -> u64 {
    300_000
}

fn default_notification_ttl_ms() -> u64 {
    600_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_tracker_capacity() -> usize {
    10_000
}

fn default_tracker_grace_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_profile_timeout_ms() -> u64 {
    30_000
}

fn default_profile_max_timeout_ms() -> u64 {
    90_000
}
