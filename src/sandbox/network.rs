//! Network mode for sandbox containers.
//!
//! Controls whether a container gets any network stack at all. Raw one-shot
//! execution runs with no network; runs that install dependencies need the
//! default bridge to reach the package registry.

use serde::{Deserialize, Serialize};

/// Network exposure mode for a sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interfaces besides loopback.
    #[default]
    None,

    /// Docker's default bridge network, with outbound access.
    Bridge,
}

impl NetworkMode {
    /// The token passed to Docker's `NetworkMode` host setting.
    pub fn docker_token(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
        }
    }

    /// Whether processes in the container can reach a package registry.
    pub fn allows_egress(&self) -> bool {
        matches!(self, Self::Bridge)
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" | "isolated" => Ok(Self::None),
            "bridge" | "on" | "default" => Ok(Self::Bridge),
            _ => Err(format!(
                "Invalid network mode '{}', expected: none or bridge",
                s
            )),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.docker_token())
    }
}
