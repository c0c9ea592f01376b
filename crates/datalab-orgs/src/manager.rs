//! Organization package installer and updater.
//!
//! Install clones into a scratch directory, reads the package's own manifest
//! to learn its declared name, and promotes the clone atomically by rename.
//! Updates are throttled: a package is only pulled when its stamp is at
//! least a day old (or when forced).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn};

use datalab_common::{ConfigRoot, DatalabError, Result};

use crate::git::{run_with_budget, VersionControl};
use crate::manifest::{OrgManifest, OrgMeta};

/// Packages younger than this are not pulled again.
pub const UPDATE_PERIOD_HOURS: i64 = 24;
/// Budget for the manifest's setup hook.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Scratch directory a clone lands in before its real name is known.
const INCOMING_DIR: &str = "_incoming";

/// An installed organization package.
#[derive(Debug, Clone)]
pub struct OrgPackage {
    pub name: String,
    pub path: PathBuf,
    pub manifest: OrgManifest,
    pub last_update: Option<DateTime<Utc>>,
}

pub struct OrgManager {
    store: ConfigRoot,
    vcs: Arc<dyn VersionControl>,
}

impl OrgManager {
    pub fn new(store: ConfigRoot, vcs: Arc<dyn VersionControl>) -> Self {
        Self { store, vcs }
    }

    /// Every installed organization whose manifest parses. Broken installs
    /// are skipped, not fatal.
    pub fn list_orgs(&self) -> Result<Vec<OrgPackage>> {
        let orgs_dir = self.store.orgs_dir();
        if !orgs_dir.is_dir() {
            return Ok(Vec::new());
        }

        let stamps = self.check_last_update()?;
        let mut orgs = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(&orgs_dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy().starts_with('_') {
                continue;
            }
            let manifest = match OrgManifest::load(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable org");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let last_update = stamps.get(&name).copied().flatten();
            orgs.push(OrgPackage {
                name,
                path,
                manifest,
                last_update,
            });
        }
        Ok(orgs)
    }

    /// Update stamps per installed organization. Organizations missing a
    /// metadata file get an empty one created on the spot and count as never
    /// updated.
    pub fn check_last_update(&self) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        let orgs_dir = self.store.orgs_dir();
        let mut stamps = HashMap::new();
        if !orgs_dir.is_dir() {
            return Ok(stamps);
        }
        for entry in fs::read_dir(&orgs_dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy().starts_with('_') {
                continue;
            }
            if !OrgMeta::exists(&path) {
                OrgMeta::default().save(&path)?;
            }
            let meta = OrgMeta::load(&path).unwrap_or_default();
            stamps.insert(
                entry.file_name().to_string_lossy().into_owned(),
                meta.last_update_time(),
            );
        }
        Ok(stamps)
    }

    /// Install an organization package from a git reference. A clone that
    /// exceeds its budget aborts the install with a warning, not an error.
    pub async fn install_from_git(&self, gitref: &str) -> Result<()> {
        let orgs_dir = self.store.orgs_dir();
        fs::create_dir_all(&orgs_dir)?;

        let scratch = orgs_dir.join(INCOMING_DIR);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }

        match self.vcs.clone_repo(gitref, &scratch).await {
            Ok(()) => {}
            Err(DatalabError::Timeout(msg)) => {
                warn!("Clone of {gitref} ran too long, aborting install: {msg}");
                if scratch.exists() {
                    fs::remove_dir_all(&scratch)?;
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // The directory name is dictated by the package's own manifest.
        let manifest = OrgManifest::load(&scratch)?;
        let org_dir = orgs_dir.join(&manifest.name);
        if org_dir.exists() {
            fs::remove_dir_all(&org_dir)?;
        }
        fs::rename(&scratch, &org_dir)?;

        self.run_setup(&org_dir, &manifest).await;
        OrgMeta::stamp_now(&org_dir)?;
        info!("Organization '{}' installed", manifest.name);
        Ok(())
    }

    /// Update one organization, or every installed one when `name` is None.
    /// In the update-all form a broken package is logged and skipped; the
    /// remaining organizations are still updated.
    pub async fn update(&self, name: Option<&str>, force: bool) -> Result<()> {
        match name {
            Some(name) => self.update_one(name, force).await,
            None => {
                for org in self.list_orgs()? {
                    if let Err(e) = self.update_one(&org.name, force).await {
                        warn!("Update of '{}' failed, skipping: {e}", org.name);
                    }
                }
                Ok(())
            }
        }
    }

    async fn update_one(&self, name: &str, force: bool) -> Result<()> {
        let org_dir = self.store.org_dir(name);
        if !org_dir.is_dir() {
            return Err(DatalabError::NotFound(format!(
                "organization '{name}' is not installed"
            )));
        }

        let stamps = self.check_last_update()?;
        let last_update = stamps.get(name).copied().flatten();
        let stale = match last_update {
            None => true,
            Some(stamp) => {
                Utc::now().signed_duration_since(stamp).num_hours() >= UPDATE_PERIOD_HOURS
            }
        };
        if !stale && !force {
            debug!("Organization '{name}' was updated recently, skipping");
            return Ok(());
        }

        info!("Updating organization '{name}'");
        match self.vcs.pull(&org_dir).await {
            Ok(()) => {}
            Err(DatalabError::Timeout(msg)) => {
                warn!("Update of '{name}' ran too long, aborting: {msg}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Ok(manifest) = OrgManifest::load(&org_dir) {
            self.run_setup(&org_dir, &manifest).await;
        }
        OrgMeta::stamp_now(&org_dir)?;
        Ok(())
    }

    /// Run the manifest's setup hook, if declared. Soft: failures and
    /// timeouts are logged, never propagated.
    async fn run_setup(&self, org_dir: &std::path::Path, manifest: &OrgManifest) {
        let Some(argv) = manifest.setup_command.as_ref().filter(|c| !c.is_empty()) else {
            return;
        };
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(org_dir);
        if let Err(e) = run_with_budget(command, SETUP_TIMEOUT, "org setup").await {
            warn!("Setup of '{}' failed: {e}", manifest.name);
        }
    }
}
