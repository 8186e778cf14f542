//! Dependency snapshot of a project's existing virtual environment.
//!
//! This never installs or resolves anything. It finds the project's venv,
//! asks its `pip` what is installed and parses the freeze listing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

/// Virtual environment directory names, checked in order.
pub const ENV_DIR_CANDIDATES: &[&str] = &["venv", ".venv", "venv3", ".venv3"];

#[cfg(not(windows))]
const LAUNCHER_DIR: &str = "bin";
#[cfg(windows)]
const LAUNCHER_DIR: &str = "Scripts";

#[cfg(not(windows))]
const PIP_BINARY: &str = "pip";
#[cfg(windows)]
const PIP_BINARY: &str = "pip.exe";

const EXACT_PIN: &str = "==";
const MINIMUM_VERSION: &str = ">=";

/// An installed package as reported by the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Empty when the listing line carried no recognised version marker.
    pub version: String,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Requirement specifier pinning this package (`name==version`, or the
    /// bare name when no version is known).
    pub fn requirement(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}{}{}", self.name, EXACT_PIN, self.version)
        }
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.requirement())
    }
}

/// Locate the launcher directory (`bin/` or `Scripts/`) of the project's venv.
pub fn find_launcher_dir(project: &Path) -> Result<PathBuf, SnapshotError> {
    ENV_DIR_CANDIDATES
        .iter()
        .map(|name| project.join(name).join(LAUNCHER_DIR))
        .find(|launcher| launcher.is_dir())
        .ok_or_else(|| SnapshotError::EnvironmentNotFound {
            project: project.to_path_buf(),
        })
}

/// Path of the venv's package-listing tool.
pub fn find_package_manager(launcher_dir: &Path) -> Result<PathBuf, SnapshotError> {
    let pip = launcher_dir.join(PIP_BINARY);
    if pip.is_file() {
        Ok(pip)
    } else {
        Err(SnapshotError::PackageManagerNotFound {
            env_dir: launcher_dir.to_path_buf(),
        })
    }
}

/// Parse a freeze-style listing, one package per non-empty line.
///
/// Each line is split on the first `==`, falling back to the first `>=`;
/// without either marker the whole line is the name. Report order is kept.
pub fn parse_freeze(listing: &str) -> Vec<Package> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, version) = line
                .split_once(EXACT_PIN)
                .or_else(|| line.split_once(MINIMUM_VERSION))
                .unwrap_or((line, ""));
            Package::new(name.trim(), version.trim())
        })
        .collect()
}

/// Enumerate the packages installed in the project's virtual environment.
pub async fn snapshot(project: &Path) -> Result<Vec<Package>, SnapshotError> {
    let launcher = find_launcher_dir(project)?;
    let pip = find_package_manager(&launcher)?;

    let output = tokio::process::Command::new(&pip)
        .arg("freeze")
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .stdin(std::process::Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(SnapshotError::ListingFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let packages = parse_freeze(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(
        project = %project.display(),
        count = packages.len(),
        "Read dependency snapshot"
    );
    Ok(packages)
}

/// Like [`snapshot`], but degrades every failure to an empty list.
pub async fn snapshot_or_empty(project: &Path) -> Vec<Package> {
    match snapshot(project).await {
        Ok(packages) => packages,
        Err(e) => {
            tracing::info!(
                project = %project.display(),
                reason = %e,
                "No dependency snapshot, running without package installation"
            );
            Vec::new()
        }
    }
}
