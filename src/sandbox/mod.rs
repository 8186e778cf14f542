//! Docker sandbox for running Python commands against a project.
//!
//! Every run gets a fresh container built from a `python:{version}-slim`
//! image, with the project copied into an ephemeral workspace and mounted
//! at `/app`:
//!
//! ```text
//! ┌─────────────────┐            ┌──────────────────┐
//! │ SandboxExecutor │──ensure───▶│    ImageCache    │──▶ pull (once per tag)
//! │                 │            ├──────────────────┤
//! │                 │──stage────▶│ WorkspaceStager  │──▶ /tmp/pybox-<uuid>
//! │                 │            ├──────────────────┤
//! │                 │──snapshot─▶│    deps (pip)    │──▶ name==version list
//! │                 │            ├──────────────────┤
//! │                 │──run──────▶│ ContainerRuntime │──▶ create/start/wait/logs/remove
//! └─────────────────┘            └──────────────────┘
//! ```
//!
//! # Profiles
//!
//! | Profile | Workspace | Network | Memory | Installs deps |
//! |---------|-----------|---------|--------|---------------|
//! | `isolated-readonly` | read-only | none | 256 MiB | no |
//! | `networked-dependency-install` | read-write | bridge | 512 MiB | yes |
//!
//! Both cap the container at half a CPU and wrap the command in a 10 second
//! deadline by default. The `python:*-slim` images ship without pytest, so
//! pytest runs need the networked profile and a project venv that has it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use pybox::config::SandboxConfig;
//! use pybox::sandbox::{DockerRuntime, SandboxExecutor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(DockerRuntime::connect().await?);
//! let executor = SandboxExecutor::new(runtime);
//!
//! let result = executor
//!     .execute(Path::new("."), "python example.py", &SandboxConfig::default())
//!     .await;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - **No leaked containers**: containers are force-removed on every exit path
//! - **No leaked workspaces**: workspaces are deleted on teardown or drop
//! - **Hard deadline**: in-container `timeout` plus a host-side watchdog
//! - **Capability dropping**: all Linux capabilities dropped, no privilege escalation;
//!   file-ownership capabilities come back only when something is mounted read-write
//! - **Failures as data**: setup errors come back as an [`ExecutionResult`], never a panic

pub mod command;
pub mod error;
pub mod executor;
pub mod image;
pub mod manager;
pub mod network;
pub mod runtime;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use command::TIMEOUT_EXIT_CODE;
pub use error::{ErrorKind, Result, SandboxError};
pub use executor::{ExecutionResult, RunPhase, SandboxExecutor};
pub use image::ImageCache;
pub use manager::{SandboxManager, SandboxManagerBuilder};
pub use network::NetworkMode;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime, RUN_LABEL};
pub use workspace::{Workspace, WorkspaceStager};
