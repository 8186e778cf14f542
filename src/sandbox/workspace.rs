//! Ephemeral workspaces.
//!
//! A project is copied into a uniquely named directory under the system
//! temp dir before it is mounted into a container, leaving virtualenvs,
//! VCS metadata and bytecode caches behind. The directory lives exactly as
//! long as its [`Workspace`] handle.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use crate::error::StagingError;

/// File and directory names never copied into a workspace.
pub const EXCLUDED_NAMES: &[&str] = &["venv", ".venv", "venv3", ".venv3", ".git", "__pycache__"];

const WORKSPACE_PREFIX: &str = "pybox-";

/// An ephemeral copy of a project. Removed on [`teardown`](Self::teardown)
/// or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively delete the workspace.
    ///
    /// The error is returned for reporting only; the handle is consumed
    /// either way and no further attempt is made on drop.
    pub fn teardown(mut self) -> std::io::Result<()> {
        self.removed = true;
        fs::remove_dir_all(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::warn!(
                workspace = %self.path.display(),
                error = %e,
                "Failed to remove workspace"
            );
        }
    }
}

/// Copies projects into fresh workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceStager {
    base_dir: PathBuf,
}

impl Default for WorkspaceStager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceStager {
    /// Stage under the system temp directory.
    pub fn new() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
        }
    }

    /// Stage under `base_dir` instead of the system temp directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Copy `project` into a new workspace on the blocking thread pool.
    pub async fn stage(&self, project: &Path) -> Result<Workspace, StagingError> {
        let stager = self.clone();
        let project = project.to_path_buf();
        let join_path = project.clone();
        tokio::task::spawn_blocking(move || stager.stage_blocking(&project))
            .await
            .map_err(|e| StagingError::CopyFailed {
                path: join_path,
                reason: format!("staging task failed: {}", e),
            })?
    }

    /// Copy `project` into a new workspace on the current thread.
    ///
    /// On failure the partially populated directory is removed before the
    /// error is returned.
    pub fn stage_blocking(&self, project: &Path) -> Result<Workspace, StagingError> {
        if !project.is_dir() {
            return Err(StagingError::SourceMissing {
                path: project.to_path_buf(),
            });
        }

        let dest = self
            .base_dir
            .join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir_all(&self.base_dir)
            .and_then(|_| fs::create_dir(&dest))
            .map_err(|e| StagingError::CreateFailed {
                path: dest.clone(),
                reason: e.to_string(),
            })?;

        // Dropping the handle on the error path removes the directory.
        let workspace = Workspace {
            path: dest,
            removed: false,
        };
        copy_tree(project, workspace.path())?;

        tracing::debug!(
            project = %project.display(),
            workspace = %workspace.path().display(),
            "Staged workspace"
        );
        Ok(workspace)
    }
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| EXCLUDED_NAMES.contains(&name))
}

/// Copy `src` into the existing directory `dest`, following symlinks.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), StagingError> {
    let walker = WalkDir::new(src)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        // Never recurse into the destination if it lives inside the source.
        .filter_entry(|entry| !is_excluded(entry) && !entry.path().starts_with(dest));

    for entry in walker {
        let entry = entry.map_err(|e| StagingError::CopyFailed {
            path: e.path().unwrap_or(src).to_path_buf(),
            reason: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StagingError::CopyFailed {
                path: entry.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        let target = dest.join(relative);

        let copied = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        copied.map_err(|e| StagingError::CopyFailed {
            path: entry.path().to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
