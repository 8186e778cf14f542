//! Sandbox configuration.
//!
//! A [`SandboxConfig`] is built fresh for every run, either from one of the
//! two named [`Profile`]s or from `PYBOX_*` environment variables layered on
//! top of a profile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::NetworkMode;

/// Default Python version used to pick the base image.
pub const DEFAULT_PYTHON_VERSION: &str = "3.11";

/// Container-side directory the workspace is mounted at.
pub const DEFAULT_WORKING_DIR: &str = "/app";

/// Container-side location of pip's download cache when running as root.
pub const DEPENDENCY_CACHE_TARGET: &str = "/root/.cache/pip";

const MIB: u64 = 1024 * 1024;

/// Capabilities container root needs to write into host-owned bind mounts.
pub const WRITE_CAPABILITIES: &[&str] = &["CHOWN", "DAC_OVERRIDE", "FOWNER"];

/// Longest accepted deadline (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Named resource/isolation presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Read-only workspace, no network, no dependency installation.
    #[default]
    IsolatedReadonly,
    /// Read-write workspace on the bridge network; installs the project's
    /// pinned packages before running the command.
    NetworkedDependencyInstall,
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "isolated-readonly" | "isolated" | "readonly" | "ro" => Ok(Self::IsolatedReadonly),
            "networked-dependency-install" | "networked" | "install" | "net" => {
                Ok(Self::NetworkedDependencyInstall)
            }
            _ => Err(format!(
                "Invalid profile '{}', expected: isolated-readonly or networked-dependency-install",
                s
            )),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IsolatedReadonly => write!(f, "isolated-readonly"),
            Self::NetworkedDependencyInstall => write!(f, "networked-dependency-install"),
        }
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Ro,
    Rw,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::Rw => "rw",
        }
    }
}

/// A single host-to-container bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: AccessMode,
}

impl MountSpec {
    /// Render as a Docker bind string (`host:container:mode`).
    pub fn to_bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_str()
        )
    }
}

/// Configuration for a single sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Preset this config was derived from.
    pub profile: Profile,
    /// Base image tag.
    pub image: String,
    /// CPU ceiling as a fraction of one core.
    pub cpu_limit: f64,
    /// Memory ceiling in bytes.
    pub memory_limit_bytes: u64,
    /// Wall-clock deadline for the whole command line.
    pub timeout_seconds: u64,
    /// Extra time given to the process after SIGTERM before it is killed.
    pub kill_grace_seconds: u64,
    pub network_mode: NetworkMode,
    /// How the staged workspace is mounted.
    pub workspace_access: AccessMode,
    pub working_dir: String,
    /// Host directory shared across runs as pip's download cache.
    pub dependency_cache: Option<PathBuf>,
    /// Whether snapshot packages are installed before the command runs.
    pub install_dependencies: bool,
    pub pids_limit: Option<i64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::for_profile(Profile::default())
    }
}

impl SandboxConfig {
    /// Build the preset configuration for `profile`.
    pub fn for_profile(profile: Profile) -> Self {
        let image = python_image(DEFAULT_PYTHON_VERSION);
        match profile {
            Profile::IsolatedReadonly => Self {
                profile,
                image,
                cpu_limit: 0.5,
                memory_limit_bytes: 256 * MIB,
                timeout_seconds: 10,
                kill_grace_seconds: 2,
                network_mode: NetworkMode::None,
                workspace_access: AccessMode::Ro,
                working_dir: DEFAULT_WORKING_DIR.to_string(),
                dependency_cache: None,
                install_dependencies: false,
                pids_limit: Some(256),
            },
            Profile::NetworkedDependencyInstall => Self {
                profile,
                image,
                cpu_limit: 0.5,
                memory_limit_bytes: 512 * MIB,
                timeout_seconds: 10,
                kill_grace_seconds: 2,
                network_mode: NetworkMode::Bridge,
                workspace_access: AccessMode::Rw,
                working_dir: DEFAULT_WORKING_DIR.to_string(),
                dependency_cache: default_dependency_cache(),
                install_dependencies: true,
                pids_limit: Some(256),
            },
        }
    }

    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// `PYBOX_PROFILE` selects the preset; every other `PYBOX_*` key
    /// overrides a single field of it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let profile = match get("PYBOX_PROFILE") {
            Some(raw) => raw.parse::<Profile>().map_err(|message| ConfigError::InvalidValue {
                key: "PYBOX_PROFILE".to_string(),
                message,
            })?,
            None => Profile::default(),
        };
        let mut config = Self::for_profile(profile);

        if let Some(version) = get("PYBOX_PYTHON_VERSION") {
            config.image = python_image(version.trim());
        }
        if let Some(image) = get("PYBOX_IMAGE") {
            config.image = image.trim().to_string();
        }
        if let Some(raw) = get("PYBOX_MEMORY") {
            config.memory_limit_bytes =
                parse_memory(&raw).map_err(|message| ConfigError::InvalidValue {
                    key: "PYBOX_MEMORY".to_string(),
                    message,
                })?;
        }
        if let Some(raw) = get("PYBOX_CPUS") {
            config.cpu_limit = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "PYBOX_CPUS".to_string(),
                message: format!("'{}' is not a number", raw),
            })?;
        }
        if let Some(raw) = get("PYBOX_TIMEOUT_SECS") {
            config.timeout_seconds = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "PYBOX_TIMEOUT_SECS".to_string(),
                message: format!("'{}' is not a whole number of seconds", raw),
            })?;
        }
        if let Some(raw) = get("PYBOX_NETWORK") {
            config.network_mode =
                raw.parse::<NetworkMode>()
                    .map_err(|message| ConfigError::InvalidValue {
                        key: "PYBOX_NETWORK".to_string(),
                        message,
                    })?;
        }
        if let Some(raw) = get("PYBOX_DEPENDENCY_CACHE") {
            config.dependency_cache = Some(PathBuf::from(raw.trim()));
        }

        config.validate()?;
        Ok(config)
    }

    /// Swap the base image for `python:{version}-slim`.
    pub fn with_python_version(mut self, version: &str) -> Self {
        self.image = python_image(version);
        self
    }

    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_dependency_cache(mut self, dir: Option<PathBuf>) -> Self {
        self.dependency_cache = dir;
        self
    }

    /// The deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// How long the host waits for the container before killing it.
    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds
                .saturating_add(self.kill_grace_seconds)
                .saturating_add(WATCHDOG_SLACK_SECS),
        )
    }

    /// CPU ceiling in Docker's nano-CPU units.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0).round() as i64
    }

    /// Ordered bind mounts for a run over `workspace`.
    ///
    /// The workspace always comes first; the dependency cache is added only
    /// when this config installs dependencies.
    pub fn mounts(&self, workspace: &Path) -> Vec<MountSpec> {
        let mut mounts = vec![MountSpec {
            host_path: workspace.to_path_buf(),
            container_path: self.working_dir.clone(),
            mode: self.workspace_access,
        }];
        if self.install_dependencies
            && let Some(ref cache) = self.dependency_cache
        {
            mounts.push(MountSpec {
                host_path: cache.clone(),
                container_path: DEPENDENCY_CACHE_TARGET.to_string(),
                mode: AccessMode::Rw,
            });
        }
        mounts
    }

    /// Capabilities to add back for this config's mounts.
    ///
    /// Empty unless something is mounted read-write.
    pub fn capabilities(&self, workspace: &Path) -> Vec<String> {
        let writable = self
            .mounts(workspace)
            .iter()
            .any(|mount| mount.mode == AccessMode::Rw);
        if writable {
            WRITE_CAPABILITIES.iter().map(|c| c.to_string()).collect()
        } else {
            Vec::new()
        }
    }

    /// Check the resource invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "image".to_string(),
                hint: "Set PYBOX_IMAGE or PYBOX_PYTHON_VERSION".to_string(),
            });
        }
        if self.memory_limit_bytes == 0 {
            return Err(invalid("memory_limit_bytes", "must be greater than zero"));
        }
        if i64::try_from(self.memory_limit_bytes).is_err() {
            return Err(invalid(
                "memory_limit_bytes",
                &format!("must be at most {} bytes", i64::MAX),
            ));
        }
        let cores = host_cores();
        if !(self.cpu_limit > 0.0 && self.cpu_limit <= cores as f64) {
            return Err(invalid(
                "cpu_limit",
                &format!("must be in (0, {}], got {}", cores, self.cpu_limit),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds", "must be greater than zero"));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECS {
            return Err(invalid(
                "timeout_seconds",
                &format!("must be at most {}", MAX_TIMEOUT_SECS),
            ));
        }
        if !self.working_dir.starts_with('/') {
            return Err(invalid("working_dir", "must be an absolute container path"));
        }
        Ok(())
    }
}

/// Extra host-side slack on top of the in-container deadline and grace.
const WATCHDOG_SLACK_SECS: u64 = 3;

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn python_image(version: &str) -> String {
    format!("python:{}-slim", version)
}

fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `~/.cache/pip` on Linux, the platform cache dir elsewhere.
fn default_dependency_cache() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("pip"))
}

/// Parse a Docker-style memory size (`256m`, `1g`, `512MiB`, raw bytes).
pub fn parse_memory(raw: &str) -> Result<u64, String> {
    let s = raw.trim().to_lowercase();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{}' is not a memory size", raw))?;
    let multiplier = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => 1024 * MIB,
        other => return Err(format!("unknown memory unit '{}'", other)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{}' overflows", raw))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_isolated_profile_defaults() {
        let config = SandboxConfig::for_profile(Profile::IsolatedReadonly);
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.memory_limit_bytes, 256 * MIB);
        assert_eq!(config.cpu_limit, 0.5);
        assert_eq!(config.network_mode, NetworkMode::None);
        assert_eq!(config.workspace_access, AccessMode::Ro);
        assert!(!config.install_dependencies);
    }

    #[test]
    fn test_networked_profile_defaults() {
        let config = SandboxConfig::for_profile(Profile::NetworkedDependencyInstall);
        assert_eq!(config.memory_limit_bytes, 512 * MIB);
        assert_eq!(config.network_mode, NetworkMode::Bridge);
        assert_eq!(config.workspace_access, AccessMode::Rw);
        assert!(config.install_dependencies);
    }

    #[test]
    fn test_profile_from_str_aliases() {
        use std::str::FromStr;
        assert_eq!(Profile::from_str("ro").unwrap(), Profile::IsolatedReadonly);
        assert_eq!(
            Profile::from_str("ISOLATED_READONLY").unwrap(),
            Profile::IsolatedReadonly
        );
        assert_eq!(
            Profile::from_str("install").unwrap(),
            Profile::NetworkedDependencyInstall
        );
        assert!(Profile::from_str("garbage").is_err());
    }

    #[test]
    fn test_profile_display_roundtrip() {
        for profile in [Profile::IsolatedReadonly, Profile::NetworkedDependencyInstall] {
            assert_eq!(profile.to_string().parse::<Profile>().unwrap(), profile);
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("256m").unwrap(), 256 * MIB);
        assert_eq!(parse_memory("512MiB").unwrap(), 512 * MIB);
        assert_eq!(parse_memory("1g").unwrap(), 1024 * MIB);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("12x").is_err());
    }

    #[test]
    fn test_from_lookup_empty_uses_default_profile() {
        let config = SandboxConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SandboxConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = SandboxConfig::from_lookup(lookup(&[
            ("PYBOX_PROFILE", "networked"),
            ("PYBOX_PYTHON_VERSION", "3.10.12"),
            ("PYBOX_MEMORY", "1g"),
            ("PYBOX_TIMEOUT_SECS", "30"),
            ("PYBOX_NETWORK", "none"),
            ("PYBOX_DEPENDENCY_CACHE", "/tmp/pip-cache"),
        ]))
        .unwrap();
        assert_eq!(config.profile, Profile::NetworkedDependencyInstall);
        assert_eq!(config.image, "python:3.10.12-slim");
        assert_eq!(config.memory_limit_bytes, 1024 * MIB);
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.network_mode, NetworkMode::None);
        assert_eq!(
            config.dependency_cache.as_deref(),
            Some(Path::new("/tmp/pip-cache"))
        );
    }

    #[test]
    fn test_explicit_image_wins_over_python_version() {
        let config = SandboxConfig::from_lookup(lookup(&[
            ("PYBOX_PYTHON_VERSION", "3.12"),
            ("PYBOX_IMAGE", "ghcr.io/acme/python:custom"),
        ]))
        .unwrap();
        assert_eq!(config.image, "ghcr.io/acme/python:custom");
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = SandboxConfig::from_lookup(lookup(&[("PYBOX_CPUS", "half")])).unwrap_err();
        assert!(err.to_string().contains("PYBOX_CPUS"));

        let err = SandboxConfig::from_lookup(lookup(&[("PYBOX_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));

        let err = SandboxConfig::from_lookup(lookup(&[("PYBOX_MEMORY", "0")])).unwrap_err();
        assert!(err.to_string().contains("memory_limit_bytes"));
    }

    #[test]
    fn test_validate_cpu_bounds() {
        let mut config = SandboxConfig::default();
        config.cpu_limit = 0.0;
        assert!(config.validate().is_err());
        config.cpu_limit = (host_cores() + 1) as f64;
        assert!(config.validate().is_err());
        config.cpu_limit = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_timeout_and_memory() {
        let config = SandboxConfig::default().with_timeout_seconds(u64::MAX);
        assert!(config.validate().is_err());
        assert!(config.watchdog_deadline() >= Duration::from_secs(MAX_TIMEOUT_SECS));

        let config = SandboxConfig::default().with_timeout_seconds(MAX_TIMEOUT_SECS);
        assert!(config.validate().is_ok());

        let mut config = SandboxConfig::default();
        config.memory_limit_bytes = parse_memory("9000000000g").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("memory_limit_bytes"));

        let err = SandboxConfig::from_lookup(lookup(&[(
            "PYBOX_TIMEOUT_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn test_nano_cpus() {
        let config = SandboxConfig::default();
        assert_eq!(config.nano_cpus(), 500_000_000);
    }

    #[test]
    fn test_mounts_isolated_has_only_workspace() {
        let config = SandboxConfig::for_profile(Profile::IsolatedReadonly)
            .with_dependency_cache(Some(PathBuf::from("/cache")));
        let mounts = config.mounts(Path::new("/tmp/ws"));
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].to_bind(), "/tmp/ws:/app:ro");
    }

    #[test]
    fn test_capabilities_follow_writable_mounts() {
        let ws = Path::new("/tmp/ws");
        assert!(SandboxConfig::default().capabilities(ws).is_empty());

        let config = SandboxConfig::for_profile(Profile::NetworkedDependencyInstall)
            .with_dependency_cache(None);
        assert_eq!(
            config.capabilities(ws),
            vec!["CHOWN", "DAC_OVERRIDE", "FOWNER"]
        );
    }

    #[test]
    fn test_mounts_networked_order() {
        let config = SandboxConfig::for_profile(Profile::NetworkedDependencyInstall)
            .with_dependency_cache(Some(PathBuf::from("/home/me/.cache/pip")));
        let binds: Vec<String> = config
            .mounts(Path::new("/tmp/ws"))
            .iter()
            .map(MountSpec::to_bind)
            .collect();
        assert_eq!(
            binds,
            vec![
                "/tmp/ws:/app:rw".to_string(),
                "/home/me/.cache/pip:/root/.cache/pip:rw".to_string(),
            ]
        );
    }

    #[test]
    fn test_watchdog_exceeds_timeout() {
        let config = SandboxConfig::default().with_timeout_seconds(10);
        assert!(config.watchdog_deadline() > config.timeout());
    }
}
