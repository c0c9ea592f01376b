// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::str::FromStr;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod store;

pub use store::{ConfigRoot, ServerConfig};

/// Container label carrying the platform a server was created for.
pub const LABEL_PLATFORM: &str = "datalab.platform";
/// Container label carrying the infrastructure name a server was created for.
pub const LABEL_INFRA: &str = "datalab.infra";

/// Infrastructure served by the built-in provisioner when no plugin claims it.
pub const DEFAULT_INFRA: &str = "local_filesystem";

/// Reserved provider name for the built-in implementation in the plugin registry.
pub const SELF_PROVIDER: &str = "self";

#[derive(Error, Debug)]
pub enum DatalabError {
    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Already Exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported Infrastructure: {0}")]
    UnsupportedInfra(String),

    #[error("Folder Preparation Error: {0}")]
    FolderPreparation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Runtime Client Error: {0}")]
    Runtime(String),

    #[error("Organization Error: {0}")]
    Org(String),

    #[error("Readiness Error: {0}")]
    Readiness(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Define the primary Result type for datalab operations
pub type Result<T> = std::result::Result<T, DatalabError>;

/// Host the server is provisioned on. Drives how the access URL is reported
/// back to the user after start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Desktop,
    RemoteVm,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Desktop => "desktop",
            Platform::RemoteVm => "remote_vm",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DatalabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(Platform::Desktop),
            "remote_vm" => Ok(Platform::RemoteVm),
            other => Err(DatalabError::Config(format!(
                "unknown platform '{other}', expected 'desktop' or 'remote_vm'"
            ))),
        }
    }
}

/// Mount strategy for the three jovyan mount points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Runtime-managed named volumes.
    Quick,
    /// Caller-specified or caller-created host directories.
    Basic,
}

impl Display for MountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountMode::Quick => f.write_str("quick"),
            MountMode::Basic => f.write_str("basic"),
        }
    }
}

impl FromStr for MountMode {
    type Err = DatalabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quick" | "q" => Ok(MountMode::Quick),
            "basic" | "b" => Ok(MountMode::Basic),
            other => Err(DatalabError::Config(format!(
                "unknown mount mode '{other}', expected 'quick' or 'basic'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for p in [Platform::Desktop, Platform::RemoteVm] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert!("laptop".parse::<Platform>().is_err());
    }

    #[test]
    fn mount_mode_accepts_short_aliases() {
        assert_eq!("q".parse::<MountMode>().unwrap(), MountMode::Quick);
        assert_eq!("b".parse::<MountMode>().unwrap(), MountMode::Basic);
        assert_eq!("quick".parse::<MountMode>().unwrap(), MountMode::Quick);
    }
}
