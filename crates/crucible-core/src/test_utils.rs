//! Shared fakes for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::LanguageProfile;
use crate::core_types::ExecutionResult;
use crate::errors::SandboxError;
use crate::sandbox::SandboxRunner;

enum Script {
    Succeed,
    Fail(String),
}

/// Sandbox stand-in with a scripted failure sequence. Once the script is
/// exhausted every call returns the configured success result.
pub struct ScriptedSandbox {
    result: ExecutionResult,
    script: Mutex<VecDeque<Script>>,
    executions: AtomicUsize,
    fail_forever: Mutex<Option<String>>,
    killed: Mutex<Vec<String>>,
    healthy: std::sync::atomic::AtomicBool,
}

impl ScriptedSandbox {
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result,
            script: Mutex::new(VecDeque::new()),
            executions: AtomicUsize::new(0),
            fail_forever: Mutex::new(None),
            killed: Mutex::new(Vec::new()),
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn fail_times(&self, n: usize, message: &str) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Script::Fail(message.to_string()));
        }
        script.push_back(Script::Succeed);
    }

    pub fn fail_always(&self, message: &str) {
        *self.fail_forever.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRunner for ScriptedSandbox {
    async fn execute(
        &self,
        _job_id: &str,
        _profile: &LanguageProfile,
        _code: &str,
        _stdin: Option<&str>,
        _timeout_ms: u64,
    ) -> Result<ExecutionResult, SandboxError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_forever.lock().unwrap().clone() {
            return Err(SandboxError::Workspace(message));
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Script::Fail(message)) => Err(SandboxError::Workspace(message)),
            Some(Script::Succeed) | None => Ok(self.result.clone()),
        }
    }

    async fn kill_jobs(&self, job_ids: &[String]) -> usize {
        let mut killed = self.killed.lock().unwrap();
        killed.extend(job_ids.iter().cloned());
        job_ids.len()
    }

    async fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
