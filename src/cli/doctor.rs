//! Doctor diagnostics CLI command.
//!
//! Checks what a sandbox run needs from the host and reports actionable
//! fixes.

use std::path::Path;
use std::process::ExitCode;

use crate::config::SandboxConfig;
use crate::deps;
use crate::sandbox::{ContainerRuntime, DockerRuntime};

/// Diagnostic check result.
#[derive(Debug)]
struct Check {
    name: &'static str,
    status: CheckStatus,
    message: String,
    fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl Check {
    fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Ok,
            message: message.into(),
            fix: None,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warning,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }

    fn error(name: &'static str, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Error,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }

    fn icon(&self) -> &'static str {
        match self.status {
            CheckStatus::Ok => "[OK]",
            CheckStatus::Warning => "[WARN]",
            CheckStatus::Error => "[ERR]",
        }
    }
}

/// Run every diagnostic and print a report.
pub async fn run_doctor_command(project: &Path, config: &SandboxConfig) -> anyhow::Result<ExitCode> {
    println!("pybox doctor");
    println!("============\n");

    let mut checks = vec![check_project(project), check_environment(project)];
    if config.install_dependencies {
        checks.push(check_dependency_cache(config));
    }

    match DockerRuntime::connect().await {
        Ok(runtime) => {
            checks.push(Check::ok("docker", "Docker daemon reachable"));
            checks.push(check_image(&runtime, &config.image).await);
            runtime.close();
        }
        Err(e) => checks.push(Check::error(
            "docker",
            e.to_string(),
            "Start Docker or point DOCKER_HOST at a running daemon",
        )),
    }

    for check in &checks {
        println!("{} {}: {}", check.icon(), check.name, check.message);
        if let Some(ref fix) = check.fix {
            println!("       fix: {}", fix);
        }
    }

    let errors = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Error)
        .count();
    let warnings = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Warning)
        .count();
    println!("\n{} error(s), {} warning(s)", errors, warnings);

    Ok(if errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check_project(project: &Path) -> Check {
    if project.is_dir() {
        Check::ok("project", format!("{}", project.display()))
    } else {
        Check::error(
            "project",
            format!("{} is not a directory", project.display()),
            "Pass the project root with --project",
        )
    }
}

fn check_environment(project: &Path) -> Check {
    match deps::find_launcher_dir(project).and_then(|dir| deps::find_package_manager(&dir)) {
        Ok(pip) => Check::ok("environment", format!("pip at {}", pip.display())),
        Err(e) => Check::warn(
            "environment",
            e.to_string(),
            "Create one with `python -m venv venv`; runs proceed without dependencies",
        ),
    }
}

fn check_dependency_cache(config: &SandboxConfig) -> Check {
    match config.dependency_cache {
        Some(ref dir) if dir.is_dir() => Check::ok("pip cache", format!("{}", dir.display())),
        Some(ref dir) => Check::warn(
            "pip cache",
            format!("{} does not exist yet", dir.display()),
            "Docker will create it on first use, owned by root",
        ),
        None => Check::warn(
            "pip cache",
            "No dependency cache configured",
            "Set PYBOX_DEPENDENCY_CACHE to reuse downloads across runs",
        ),
    }
}

async fn check_image(runtime: &dyn ContainerRuntime, image: &str) -> Check {
    match runtime.image_exists(image).await {
        Ok(true) => Check::ok("image", format!("{} present", image)),
        Ok(false) => Check::warn(
            "image",
            format!("{} not pulled yet", image),
            format!("It is pulled on first run, or now with `docker pull {}`", image),
        ),
        Err(e) => Check::error("image", e.to_string(), "Check Docker daemon health"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::Profile;
    use crate::sandbox::testing::MockRuntime;

    #[test]
    fn test_check_project() {
        let dir = TempDir::new().unwrap();
        assert_eq!(check_project(dir.path()).status, CheckStatus::Ok);
        assert_eq!(
            check_project(&dir.path().join("missing")).status,
            CheckStatus::Error
        );
    }

    #[test]
    fn test_missing_environment_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let check = check_environment(dir.path());
        assert_eq!(check.status, CheckStatus::Warning);
        assert!(check.fix.is_some());
    }

    #[test]
    fn test_dependency_cache_check() {
        let dir = TempDir::new().unwrap();
        let config = SandboxConfig::for_profile(Profile::NetworkedDependencyInstall)
            .with_dependency_cache(Some(dir.path().to_path_buf()));
        assert_eq!(check_dependency_cache(&config).status, CheckStatus::Ok);

        let config = config.with_dependency_cache(Some(dir.path().join("nope")));
        assert_eq!(check_dependency_cache(&config).status, CheckStatus::Warning);

        fs::create_dir(dir.path().join("nope")).unwrap();
        assert_eq!(check_dependency_cache(&config).status, CheckStatus::Ok);
    }

    #[tokio::test]
    async fn test_check_image() {
        let runtime = MockRuntime::new().with_image("python:3.11-slim");
        assert_eq!(
            check_image(&runtime, "python:3.11-slim").await.status,
            CheckStatus::Ok
        );
        assert_eq!(
            check_image(&runtime, "python:3.13-slim").await.status,
            CheckStatus::Warning
        );
    }

    #[test]
    fn test_icons() {
        assert_eq!(Check::ok("a", "b").icon(), "[OK]");
        assert_eq!(Check::warn("a", "b", "c").icon(), "[WARN]");
        assert_eq!(Check::error("a", "b", "c").icon(), "[ERR]");
    }
}
