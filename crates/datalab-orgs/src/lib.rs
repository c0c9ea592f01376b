//! Organization packages: installation and update over version control,
//! manifest model, and the infra plugin registry.

pub mod git;
pub mod manager;
pub mod manifest;
pub mod registry;

pub use git::{SystemGit, VersionControl};
pub use manager::{OrgManager, OrgPackage};
pub use manifest::{CliBody, OrgManifest, OrgMeta, PluginEntry};
pub use registry::{
    command_overrides, CommandOverride, InfraPlugin, PluginCreateRequest, PluginRegistry,
    Resolution,
};
