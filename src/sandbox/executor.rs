//! Sandbox executor.
//!
//! Runs one command in one freshly built container:
//!
//! ```text
//! INIT -> IMAGE_READY -> WORKSPACE_READY -> CONTEXT_BUILT -> RUNNING
//!      -> COMPLETED | TIMED_OUT | FAILED -> CLEANED_UP
//! ```
//!
//! Every failure before the process starts is folded into an
//! [`ExecutionResult`] with an [`ErrorKind`] and no exit code. The container
//! and workspace are released on every path out of a run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::deps::{self, Package};
use crate::sandbox::command::{self, TIMEOUT_EXIT_CODE};
use crate::sandbox::error::{ErrorKind, SandboxError};
use crate::sandbox::image::ImageCache;
use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, RUN_LABEL};
use crate::sandbox::workspace::WorkspaceStager;

/// Exit code `timeout` returns when it had to follow up with SIGKILL.
const KILLED_EXIT_CODE: i64 = 137;

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Init,
    ImageReady,
    WorkspaceReady,
    ContextBuilt,
    Running,
    Completed,
    TimedOut,
    Failed,
    CleanedUp,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::ImageReady => "IMAGE_READY",
            Self::WorkspaceReady => "WORKSPACE_READY",
            Self::ContextBuilt => "CONTEXT_BUILT",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
            Self::CleanedUp => "CLEANED_UP",
        };
        f.write_str(s)
    }
}

fn enter(phase: RunPhase) {
    tracing::debug!(phase = %phase, "Run state");
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// Absent only when the run failed before the process started.
    pub exit_code: Option<i64>,
    /// Interleaved stdout and stderr.
    pub output: String,
    pub error_kind: Option<ErrorKind>,
    /// Human-readable reason for `error_kind`.
    pub detail: Option<String>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionResult {
    fn completed(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        clock: Instant,
        exit_code: i64,
        output: String,
        timed_out: bool,
    ) -> Self {
        Self {
            run_id,
            exit_code: Some(exit_code),
            output,
            error_kind: None,
            detail: None,
            timed_out,
            started_at,
            duration: clock.elapsed(),
        }
    }

    fn failed(run_id: Uuid, started_at: DateTime<Utc>, clock: Instant, err: &SandboxError) -> Self {
        Self {
            run_id,
            exit_code: None,
            output: String::new(),
            error_kind: Some(err.kind()),
            detail: Some(err.to_string()),
            timed_out: false,
            started_at,
            duration: clock.elapsed(),
        }
    }

    /// Whether the command ran and exited zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.exit_code, self.error_kind) {
            (Some(code), _) => write!(f, "Exit Code: {}\n\nOUTPUT:\n{}", code, self.output.trim()),
            (None, kind) => {
                let stage = match kind {
                    Some(ErrorKind::ImageUnavailable) => "image preparation",
                    Some(ErrorKind::StagingError) => "workspace staging",
                    Some(ErrorKind::ContainerSetupError) => "container setup",
                    Some(ErrorKind::ContainerRuntimeError) | None => "container launch",
                };
                let detail = self.detail.as_deref().unwrap_or("unknown error");
                write!(
                    f,
                    "Sandbox {} failed ({}): {}",
                    stage,
                    kind.unwrap_or(ErrorKind::ContainerRuntimeError),
                    detail.replace('\n', " ")
                )
            }
        }
    }
}

/// Removes a container when released, or from a spawned task if dropped
/// while still armed (cancelled future, panic during the run).
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove_container(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = Arc::clone(&self.runtime);
                handle.spawn(async move {
                    if let Err(e) = runtime.kill_container(&id).await {
                        tracing::debug!(container = %id, error = %e, "Kill before removal failed");
                    }
                    remove_container(runtime.as_ref(), &id).await;
                });
            }
            Err(_) => {
                tracing::warn!(container = %id, "No runtime to remove abandoned container");
            }
        }
    }
}

async fn remove_container(runtime: &dyn ContainerRuntime, id: &str) {
    match runtime.remove_container(id).await {
        Ok(()) => tracing::debug!(container = %id, "Container removed"),
        Err(e) => tracing::warn!(container = %id, error = %e, "Failed to remove container"),
    }
}

/// Anything that goes wrong once the container exists is a runtime error.
fn as_runtime_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::ContainerRuntime { .. } => err,
        other => SandboxError::ContainerRuntime {
            reason: other.to_string(),
        },
    }
}

fn as_setup_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::ContainerSetup { .. } => err,
        other => SandboxError::ContainerSetup {
            reason: other.to_string(),
        },
    }
}

/// How the process inside the container ended.
struct Exit {
    code: i64,
    timed_out: bool,
    output: String,
}

/// Builds, runs and tears down sandbox containers.
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<ImageCache>,
    stager: WorkspaceStager,
}

impl SandboxExecutor {
    /// Create an executor over an injected runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let images = Arc::new(ImageCache::new(Arc::clone(&runtime)));
        Self {
            runtime,
            images,
            stager: WorkspaceStager::new(),
        }
    }

    /// Use a custom stager (e.g. a different temp root).
    pub fn with_stager(mut self, stager: WorkspaceStager) -> Self {
        self.stager = stager;
        self
    }

    /// Share an existing image cache instead of the executor's own.
    pub fn with_image_cache(mut self, images: Arc<ImageCache>) -> Self {
        self.images = images;
        self
    }

    pub fn image_cache(&self) -> &Arc<ImageCache> {
        &self.images
    }

    pub fn stager(&self) -> &WorkspaceStager {
        &self.stager
    }

    /// Full one-shot pipeline over a project directory: ensure the image,
    /// stage the project, snapshot its dependencies, run, tear down.
    pub async fn execute(
        &self,
        project: &Path,
        command: &str,
        config: &SandboxConfig,
    ) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sandbox_run", run_id = %run_id);
        async {
            let started_at = Utc::now();
            let clock = Instant::now();
            enter(RunPhase::Init);

            if let Err(e) = self.prepare_image(config).await {
                return self.fail(run_id, started_at, clock, &e);
            }

            let workspace = match self.stager.stage(project).await {
                Ok(workspace) => workspace,
                Err(e) => return self.fail(run_id, started_at, clock, &SandboxError::from(e)),
            };
            enter(RunPhase::WorkspaceReady);

            let packages = if config.install_dependencies {
                deps::snapshot_or_empty(project).await
            } else {
                Vec::new()
            };

            let result = self
                .run_prepared(run_id, started_at, clock, workspace.path(), &packages, command, config)
                .await;

            if let Err(e) = workspace.teardown() {
                tracing::warn!(error = %e, "Failed to remove workspace");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run `command` over an already staged workspace.
    ///
    /// `packages` are pinned and installed first when the config allows
    /// dependency installation.
    pub async fn run(
        &self,
        workspace: &Path,
        packages: &[Package],
        command: &str,
        config: &SandboxConfig,
    ) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sandbox_run", run_id = %run_id);
        async {
            let started_at = Utc::now();
            let clock = Instant::now();
            enter(RunPhase::Init);

            if let Err(e) = self.prepare_image(config).await {
                return self.fail(run_id, started_at, clock, &e);
            }
            enter(RunPhase::WorkspaceReady);

            self.run_prepared(run_id, started_at, clock, workspace, packages, command, config)
                .await
        }
        .instrument(span)
        .await
    }

    async fn prepare_image(&self, config: &SandboxConfig) -> Result<(), SandboxError> {
        config.validate().map_err(|e| SandboxError::Config {
            reason: e.to_string(),
        })?;
        self.images.ensure(&config.image).await?;
        enter(RunPhase::ImageReady);
        Ok(())
    }

    /// Result for a run that could not even be attempted.
    pub fn fail_before_start(&self, err: &SandboxError) -> ExecutionResult {
        self.fail(Uuid::new_v4(), Utc::now(), Instant::now(), err)
    }

    fn fail(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        clock: Instant,
        err: &SandboxError,
    ) -> ExecutionResult {
        tracing::error!(error = %err, kind = %err.kind(), "Sandbox run failed");
        enter(RunPhase::Failed);
        enter(RunPhase::CleanedUp);
        ExecutionResult::failed(run_id, started_at, clock, err)
    }

    /// Build the container spec for a run.
    pub fn container_spec(
        run_id: Uuid,
        workspace: &Path,
        packages: &[Package],
        command: &str,
        config: &SandboxConfig,
    ) -> ContainerSpec {
        let packages = if config.install_dependencies {
            packages
        } else {
            if !packages.is_empty() {
                tracing::debug!(
                    count = packages.len(),
                    profile = %config.profile,
                    "Profile does not install dependencies, skipping packages"
                );
            }
            &[]
        };
        if !packages.is_empty() && !config.network_mode.allows_egress() {
            tracing::warn!("Installing dependencies without network access will likely fail");
        }

        let line = command::command_line(packages, command);
        ContainerSpec {
            name: format!("pybox-{}", run_id.simple()),
            image: config.image.clone(),
            cmd: command::container_cmd(&line, config.timeout_seconds, config.kill_grace_seconds),
            working_dir: config.working_dir.clone(),
            env: vec![
                "PYTHONDONTWRITEBYTECODE=1".to_string(),
                "PYTHONUNBUFFERED=1".to_string(),
            ],
            mounts: config.mounts(workspace),
            nano_cpus: config.nano_cpus(),
            memory_bytes: i64::try_from(config.memory_limit_bytes).unwrap_or(i64::MAX),
            network_mode: config.network_mode,
            pids_limit: config.pids_limit,
            cap_add: config.capabilities(workspace),
            labels: HashMap::from([(RUN_LABEL.to_string(), run_id.to_string())]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_prepared(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        clock: Instant,
        workspace: &Path,
        packages: &[Package],
        command: &str,
        config: &SandboxConfig,
    ) -> ExecutionResult {
        let spec = Self::container_spec(run_id, workspace, packages, command, config);

        let id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => return self.fail(run_id, started_at, clock, &as_setup_error(e)),
        };
        let guard = ContainerGuard::new(Arc::clone(&self.runtime), id.clone());
        enter(RunPhase::ContextBuilt);
        tracing::info!(
            container = %id,
            image = %spec.image,
            network = %spec.network_mode,
            "Starting sandbox container"
        );

        let outcome = self.drive(&id, config).await;
        guard.release().await;

        match outcome {
            Ok(exit) => {
                enter(if exit.timed_out {
                    RunPhase::TimedOut
                } else {
                    RunPhase::Completed
                });
                enter(RunPhase::CleanedUp);
                tracing::info!(
                    exit_code = exit.code,
                    timed_out = exit.timed_out,
                    "Sandbox run finished"
                );
                ExecutionResult::completed(
                    run_id,
                    started_at,
                    clock,
                    exit.code,
                    exit.output,
                    exit.timed_out,
                )
            }
            Err(e) => self.fail(run_id, started_at, clock, &e),
        }
    }

    /// Start the container and race its exit against the watchdog.
    async fn drive(&self, id: &str, config: &SandboxConfig) -> Result<Exit, SandboxError> {
        self.runtime
            .start_container(id)
            .await
            .map_err(as_runtime_error)?;
        enter(RunPhase::Running);
        let clock = Instant::now();

        let (code, timed_out) =
            match tokio::time::timeout(config.watchdog_deadline(), self.runtime.wait_container(id))
                .await
            {
                Ok(Ok(code)) => {
                    let timed_out = code == TIMEOUT_EXIT_CODE
                        || (code == KILLED_EXIT_CODE && clock.elapsed() >= config.timeout());
                    (code, timed_out)
                }
                Ok(Err(e)) => return Err(as_runtime_error(e)),
                Err(_) => {
                    tracing::warn!(
                        container = %id,
                        deadline = ?config.watchdog_deadline(),
                        "Container outlived its deadline, killing"
                    );
                    if let Err(e) = self.runtime.kill_container(id).await {
                        tracing::warn!(container = %id, error = %e, "Failed to kill container");
                    }
                    (TIMEOUT_EXIT_CODE, true)
                }
            };

        let output = match self.runtime.logs(id).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "Failed to collect container logs");
                String::new()
            }
        };

        Ok(Exit {
            code: if timed_out { TIMEOUT_EXIT_CODE } else { code },
            timed_out,
            output,
        })
    }
}
