//! Container runtime capability.
//!
//! The executor and image cache never talk to Docker directly. They are
//! handed an `Arc<dyn ContainerRuntime>` at construction; [`DockerRuntime`]
//! is the production implementation on top of bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;

use crate::config::MountSpec;
use crate::sandbox::NetworkMode;
use crate::sandbox::error::{Result, SandboxError};

/// Label attached to every container so stray ones can be found.
pub const RUN_LABEL: &str = "pybox.run-id";

/// Everything needed to construct one isolated container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub network_mode: NetworkMode,
    pub pids_limit: Option<i64>,
    /// Capabilities added back after dropping all of them.
    pub cap_add: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Docker host settings for this spec.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            binds: Some(self.mounts.iter().map(MountSpec::to_bind).collect()),
            nano_cpus: Some(self.nano_cpus),
            memory: Some(self.memory_bytes),
            // Equal to memory: no swap on top of the ceiling.
            memory_swap: Some(self.memory_bytes),
            network_mode: Some(self.network_mode.docker_token().to_string()),
            pids_limit: self.pids_limit,
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: (!self.cap_add.is_empty()).then(|| self.cap_add.clone()),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

/// Operations the sandbox needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image` from its registry.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Block until the container exits and return its status code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Combined stdout/stderr in the order the engine reports it.
    async fn logs(&self, id: &str) -> Result<String>;

    /// Send SIGKILL to the container.
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the platform defaults (`DOCKER_HOST` or the local socket)
    /// and verify the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| SandboxError::DockerNotAvailable {
                reason: e.to_string(),
            })?;
        let runtime = Self { docker };
        runtime.ping().await?;
        tracing::debug!("Connected to Docker daemon");
        Ok(runtime)
    }

    /// Wrap an existing bollard client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Release the client. The underlying connection pool closes on drop.
    pub fn close(self) {
        tracing::debug!("Closing Docker client");
        drop(self.docker);
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::DockerNotAvailable {
                reason: e.to_string(),
            })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(status) = info.status {
                tracing::trace!(image = %image, %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(!spec.network_mode.allows_egress()),
            host_config: Some(spec.host_config()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::ContainerSetup {
                reason: e.to_string(),
            })?;
        for warning in &response.warnings {
            tracing::warn!(container = %response.id, %warning, "Docker create warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ContainerRuntime {
                reason: e.to_string(),
            })
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut status_code = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => status_code = Some(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code.
                Err(BollardError::DockerContainerWaitError { code, .. }) => {
                    status_code = Some(code)
                }
                Err(e) => {
                    return Err(SandboxError::ContainerRuntime {
                        reason: e.to_string(),
                    });
                }
            }
        }
        status_code.ok_or_else(|| SandboxError::ContainerRuntime {
            reason: format!("no exit status reported for container {}", id),
        })
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::ContainerRuntime {
                reason: e.to_string(),
            })?;
            buf.extend_from_slice(&chunk.into_bytes());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: already gone; 409: not running any more.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
