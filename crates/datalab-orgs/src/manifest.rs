//! On-disk shape of an installed organization package.
//!
//! `org.json` is the package's own manifest (written by the organization,
//! read after clone); `org_meta.json` is installer-owned metadata.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use datalab_common::{DatalabError, Result};

pub const MANIFEST_FILE: &str = "org.json";
pub const META_FILE: &str = "org_meta.json";

/// Update stamps are persisted in this fixed format, always UTC.
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A command surface contributed by the organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliBody {
    pub boundary_name: String,
    #[serde(default)]
    pub platform_names: Vec<String>,
    /// Name of the built-in subject this body fully replaces, if any.
    #[serde(default)]
    pub overrides: Option<String>,
    /// Handler executable (argv) relative to the org directory; receives the
    /// remaining command line verbatim.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// An infrastructure plugin contributed by the organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub supported_infras: Vec<String>,
    /// Creation handler (argv) relative to the org directory; receives the
    /// creation spec as JSON on stdin.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgManifest {
    pub name: String,
    #[serde(default)]
    pub cli_bodies: Vec<CliBody>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    /// Dependency-install hook, run after clone/pull with a hard timeout.
    #[serde(default)]
    pub setup_command: Option<Vec<String>>,
}

impl OrgManifest {
    pub fn load(org_dir: &Path) -> Result<Self> {
        let path = org_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| {
            DatalabError::Org(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            DatalabError::Org(format!("cannot parse manifest {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgMeta {
    #[serde(default)]
    pub last_update: Option<String>,
}

impl OrgMeta {
    pub fn load(org_dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(org_dir.join(META_FILE))?;
        serde_json::from_str(&raw)
            .map_err(|e| DatalabError::Org(format!("cannot parse org metadata: {e}")))
    }

    pub fn save(&self, org_dir: &Path) -> Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| DatalabError::Org(format!("cannot serialize org metadata: {e}")))?;
        fs::write(org_dir.join(META_FILE), json)?;
        Ok(())
    }

    pub fn exists(org_dir: &Path) -> bool {
        org_dir.join(META_FILE).exists()
    }

    /// Write a fresh stamp carrying the current UTC time.
    pub fn stamp_now(org_dir: &Path) -> Result<()> {
        let meta = OrgMeta {
            last_update: Some(Utc::now().format(STAMP_FORMAT).to_string()),
        };
        meta.save(org_dir)
    }

    /// Parsed update stamp; `None` means never updated.
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_update.as_deref()?;
        NaiveDateTime::parse_from_str(raw, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}
