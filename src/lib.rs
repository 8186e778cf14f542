//! pybox: run Python code and test suites in short-lived Docker sandboxes.
//!
//! A project is copied into an ephemeral workspace, its installed packages
//! are read from its virtual environment, and the requested command runs in
//! a fresh, resource-bounded container that is removed afterwards.
//!
//! - [`classifier`] decides whether a path holds pytest or unittest tests
//! - [`deps`] snapshots the packages installed in the project's venv
//! - [`sandbox`] stages workspaces, caches images and runs containers
//! - [`tools`] maps the front-end operations onto sandbox commands

pub mod classifier;
pub mod cli;
pub mod config;
pub mod deps;
pub mod error;
pub mod sandbox;
pub mod tools;

pub use classifier::TestType;
pub use config::{Profile, SandboxConfig};
pub use deps::Package;
pub use error::{Error, Result};
pub use sandbox::{ExecutionResult, SandboxExecutor, SandboxManager};
pub use tools::SandboxTools;
