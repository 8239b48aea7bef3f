//! Docker-backed sandbox runner
//!
//! One container per job: hard memory ceiling, CPU share cap, no network,
//! read-only root with a small writable tmpfs, and the job's private
//! working area bind-mounted. The wall-clock timeout is raced against
//! output collection with `tokio::select!`; the container is forcibly
//! removed on every exit path, so no instance or workspace outlives its
//! job. Live containers are registered by job id so a session kill can
//! target exactly the instances it owns.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;

use super::collector::{CollectedOutput, OutputCollector};
use super::SandboxRunner;
use crate::config::{LanguageProfile, LanguageRegistry, SandboxConfig};
use crate::core_types::{ExecutionResult, Termination};
use crate::errors::SandboxError;

const CONTAINER_WORK_DIR: &str = "/workspace";
const STDIN_FILENAME: &str = "input.txt";
const TIMEOUT_MARKER: &str = "\nExecution timed out";

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    /// job id -> container id for every currently-running instance.
    instances: Mutex<HashMap<String, String>>,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            config,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Verify the daemon is reachable and, if configured, pre-pull every
    /// profile image so first executions do not pay the pull latency.
    pub async fn initialize(&self, registry: &LanguageRegistry) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        log::info!("Docker sandbox initialized");
        if self.config.pull_images_on_start {
            for image in registry.images() {
                if let Err(e) = self.pull_image(&image).await {
                    log::warn!("failed to pull image {image}: {e}");
                }
            }
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        log::info!("pulling image {image}");
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|_| SandboxError::ImageUnavailable(image.to_string()))?;
        }
        Ok(())
    }

    fn container_name(job_id: &str) -> String {
        format!("crucible-exec-{job_id}")
    }

    /// What to remove for a kill: the registered container id for runs in
    /// this process, else the deterministic container name, which reaches
    /// instances started by a worker in another process.
    fn kill_target(&self, job_id: &str) -> String {
        self.deregister(job_id)
            .unwrap_or_else(|| Self::container_name(job_id))
    }

    fn shell_line(profile: &LanguageProfile, has_stdin: bool) -> String {
        if has_stdin {
            format!("{} < {}", profile.command, STDIN_FILENAME)
        } else {
            profile.command.clone()
        }
    }

    fn register(&self, job_id: &str, container_id: &str) {
        self.instances
            .lock()
            .expect("instance registry poisoned")
            .insert(job_id.to_string(), container_id.to_string());
    }

    fn deregister(&self, job_id: &str) -> Option<String> {
        self.instances
            .lock()
            .expect("instance registry poisoned")
            .remove(job_id)
    }

    /// Stream output until the container exits or the deadline fires.
    /// Returns the collected output, the exit code (None on timeout) and
    /// whether the timeout elapsed.
    async fn collect_run(
        &self,
        container_id: &str,
        timeout_ms: u64,
    ) -> Result<(CollectedOutput, Option<i64>, bool), SandboxError> {
        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<BollardWaitContainerOptionsQuery>);
        let mut log_stream = self.docker.logs(
            container_id,
            Some(BollardLogsOptionsQuery {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut collector = OutputCollector::new(self.config.max_output_bytes);
        let deadline = tokio::time::sleep(tokio::time::Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);

        let mut timed_out = false;
        loop {
            tokio::select! {
                frame = log_stream.next() => match frame {
                    Some(Ok(LogOutput::StdOut { message })) => collector.push_stdout(&message),
                    Some(Ok(LogOutput::StdErr { message })) => collector.push_stderr(&message),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SandboxError::DockerApi(e)),
                    None => break,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            None
        } else {
            match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard surfaces a non-zero exit as a wait error.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => return Err(SandboxError::DockerApi(e)),
                None => return Err(SandboxError::WaitInterrupted(container_id.to_string())),
            }
        };

        Ok((collector.finish(), exit_code, timed_out))
    }

    /// Kill + remove in one call. Removal failures are logged only: the
    /// container may already be gone, and teardown must never mask the
    /// run's outcome.
    async fn teardown(&self, job_id: &str, container_id: &str) {
        self.deregister(job_id);
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = result {
            log::warn!("container cleanup failed for job {job_id}: {e}");
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerSandbox {
    async fn execute(
        &self,
        job_id: &str,
        profile: &LanguageProfile,
        code: &str,
        stdin: Option<&str>,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();

        // Private working area; dropped (and removed) on every return path.
        let workspace = tempfile::Builder::new()
            .prefix("crucible-job-")
            .tempdir()
            .map_err(|e| SandboxError::Workspace(e.to_string()))?;

        let code_path = workspace.path().join(&profile.filename);
        let mut file = tokio::fs::File::create(&code_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        if let Some(input) = stdin {
            tokio::fs::write(workspace.path().join(STDIN_FILENAME), input).await?;
        }

        let host_workspace = workspace
            .path()
            .to_str()
            .ok_or_else(|| SandboxError::Workspace("non-UTF-8 workspace path".into()))?
            .to_string();

        self.pull_image(&profile.image).await?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(Self::container_name(job_id)),
            ..Default::default()
        });
        let body = ContainerCreateBody {
            image: Some(profile.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                Self::shell_line(profile, stdin.is_some()),
            ]),
            working_dir: Some(CONTAINER_WORK_DIR.to_string()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                memory: Some(self.config.memory_bytes),
                cpu_shares: Some(self.config.cpu_shares),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                binds: Some(vec![format!("{host_workspace}:{CONTAINER_WORK_DIR}:rw")]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    format!("size={}m,exec", self.config.tmpfs_size_mb),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, body).await?;
        self.register(job_id, &container.id);

        let run = async {
            self.docker
                .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
                .await?;
            self.collect_run(&container.id, timeout_ms).await
        }
        .await;

        // Non-negotiable: the instance never outlives the job.
        self.teardown(job_id, &container.id).await;

        let (output, exit_code, timed_out) = run?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let mut stderr = output.stderr;
        let termination = if timed_out {
            stderr.push_str(TIMEOUT_MARKER);
            Termination::Timeout
        } else {
            match exit_code {
                Some(0) => Termination::Success,
                Some(code) => Termination::RuntimeError { exit_code: code },
                None => return Err(SandboxError::WaitInterrupted(container.id)),
            }
        };

        log::info!(
            "job {job_id} finished in {execution_time_ms}ms (timed_out={timed_out}, termination={termination:?})"
        );

        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr,
            execution_time_ms,
            timed_out,
            termination,
        })
    }

    async fn kill_jobs(&self, job_ids: &[String]) -> usize {
        let mut killed = 0;
        for job_id in job_ids {
            let target = self.kill_target(job_id);
            match self
                .docker
                .remove_container(
                    &target,
                    Some(BollardRemoveContainerOptionsQuery {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    log::info!("killed sandbox instance for job {job_id}");
                    killed += 1;
                }
                // The container may have exited already, or never started.
                Err(e) => log::debug!("no instance to kill for job {job_id}: {e}"),
            }
        }
        killed
    }

    async fn healthy(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}
