//! Long-lived sandbox over one project.
//!
//! The manager stages the project once at construction and runs any number
//! of commands against that single workspace, one at a time. Each run
//! snapshots the project's installed packages afresh, so the container sees
//! the versions the developer has right now.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Profile, SandboxConfig};
use crate::deps::{self, Package};
use crate::error::{Result, StagingError};
use crate::sandbox::error::SandboxError;
use crate::sandbox::executor::{ExecutionResult, SandboxExecutor};
use crate::sandbox::runtime::ContainerRuntime;
use crate::sandbox::workspace::{Workspace, WorkspaceStager};

/// Owns one staged workspace and runs commands against it.
pub struct SandboxManager {
    executor: SandboxExecutor,
    project_root: PathBuf,
    config: SandboxConfig,
    workspace: Option<Workspace>,
    /// Held for the whole of a run so the read-write workspace is never
    /// mounted by two containers at once.
    run_lock: Mutex<()>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("project_root", &self.project_root)
            .field("image", &self.config.image)
            .field("workspace", &self.workspace_path())
            .finish()
    }
}

impl SandboxManager {
    pub fn builder(project_root: impl Into<PathBuf>) -> SandboxManagerBuilder {
        SandboxManagerBuilder::new(project_root)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Path of the staged workspace, until [`cleanup`](Self::cleanup).
    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::path)
    }

    /// Packages currently installed in the original project's venv.
    pub async fn packages(&self) -> Result<Vec<Package>> {
        Ok(deps::snapshot(&self.project_root).await?)
    }

    /// Run `command` in a fresh container over the staged workspace.
    ///
    /// Concurrent calls queue behind each other.
    pub async fn run(&self, command: &str) -> ExecutionResult {
        let Some(workspace) = self.workspace.as_ref() else {
            let err = SandboxError::Staging(StagingError::Released {
                project: self.project_root.clone(),
            });
            return self.executor.fail_before_start(&err);
        };
        let _running = self.run_lock.lock().await;

        let packages = if self.config.install_dependencies {
            self.packages().await.unwrap_or_else(|e| {
                tracing::info!(
                    project = %self.project_root.display(),
                    reason = %e,
                    "No dependency snapshot, running without package installation"
                );
                Vec::new()
            })
        } else {
            Vec::new()
        };
        tracing::debug!(
            project = %self.project_root.display(),
            packages = packages.len(),
            "Running command in managed sandbox"
        );
        self.executor
            .run(workspace.path(), &packages, command, &self.config)
            .await
    }

    /// Delete the staged workspace. Later runs report a staging error.
    pub fn cleanup(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            match workspace.teardown() {
                Ok(()) => tracing::debug!(workspace = %path.display(), "Workspace removed"),
                Err(e) => {
                    tracing::warn!(workspace = %path.display(), error = %e, "Failed to remove workspace")
                }
            }
        }
    }
}

/// Builder for [`SandboxManager`].
#[derive(Debug, Clone)]
pub struct SandboxManagerBuilder {
    project_root: PathBuf,
    config: SandboxConfig,
    python_version: Option<String>,
    timeout_seconds: Option<u64>,
    stager: WorkspaceStager,
}

impl SandboxManagerBuilder {
    /// Start from the networked dependency-install profile.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            config: SandboxConfig::for_profile(Profile::NetworkedDependencyInstall),
            python_version: None,
            timeout_seconds: None,
            stager: WorkspaceStager::new(),
        }
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.config = SandboxConfig::for_profile(profile);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn python_version(mut self, version: impl Into<String>) -> Self {
        self.python_version = Some(version.into());
        self
    }

    pub fn timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn stager(mut self, stager: WorkspaceStager) -> Self {
        self.stager = stager;
        self
    }

    /// Ensure the base image and stage the project.
    ///
    /// Nothing is left on disk if either step fails.
    pub async fn build(self, runtime: Arc<dyn ContainerRuntime>) -> Result<SandboxManager> {
        let mut config = self.config;
        if let Some(version) = self.python_version {
            config = config.with_python_version(&version);
        }
        if let Some(secs) = self.timeout_seconds {
            config = config.with_timeout_seconds(secs);
        }
        config.validate()?;

        let executor = SandboxExecutor::new(runtime).with_stager(self.stager);
        executor.image_cache().ensure(&config.image).await?;
        let workspace = executor.stager().stage(&self.project_root).await?;

        tracing::info!(
            project = %self.project_root.display(),
            workspace = %workspace.path().display(),
            image = %config.image,
            "Sandbox manager ready"
        );
        Ok(SandboxManager {
            executor,
            project_root: self.project_root,
            config,
            workspace: Some(workspace),
            run_lock: Mutex::new(()),
        })
    }
}
