//! On-disk layout of the `~/.datalab` config root.
//!
//! Server configs are never hard-deleted: `trash_server` renames the server's
//! config directory into the trash bin with a timestamp suffix so an
//! accidental remove can be recovered by hand.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::{DatalabError, MountMode, Platform, Result};

/// Persisted per-server configuration, written at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub instance_name: String,
    pub platform: Platform,
    pub infra_name: String,
    pub mount_mode: MountMode,
    pub image: String,
    pub gpu_enabled: bool,
    pub cpu_limit: i64,
    pub memory_limit: i64,
}

/// Paths under the user's config root.
#[derive(Debug, Clone)]
pub struct ConfigRoot {
    root: PathBuf,
}

impl ConfigRoot {
    /// Config root under the user's home directory (`~/.datalab`).
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| DatalabError::Config("cannot resolve home directory".into()))?;
        Ok(Self::at(home.join(".datalab")))
    }

    /// Config root at an explicit path. Used by tests.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn orgs_dir(&self) -> PathBuf {
        self.root.join("orgs")
    }

    pub fn org_dir(&self, org_name: &str) -> PathBuf {
        self.orgs_dir().join(org_name)
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.root.join("servers")
    }

    pub fn server_dir(&self, instance_name: &str) -> PathBuf {
        self.servers_dir().join(instance_name)
    }

    pub fn trashed_servers_dir(&self) -> PathBuf {
        self.root.join("trash_bin").join("servers")
    }

    fn server_config_path(&self, instance_name: &str) -> PathBuf {
        self.server_dir(instance_name).join("server.json")
    }

    pub fn server_config_exists(&self, instance_name: &str) -> bool {
        self.server_config_path(instance_name).exists()
    }

    pub fn save_server_config(&self, config: &ServerConfig) -> Result<()> {
        let dir = self.server_dir(&config.instance_name);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| DatalabError::Config(format!("cannot serialize server config: {e}")))?;
        fs::write(self.server_config_path(&config.instance_name), json)?;
        Ok(())
    }

    pub fn load_server_config(&self, instance_name: &str) -> Result<ServerConfig> {
        let path = self.server_config_path(instance_name);
        if !path.exists() {
            return Err(DatalabError::NotFound(format!(
                "no saved config for server '{instance_name}'"
            )));
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| DatalabError::Config(format!("cannot parse server config: {e}")))
    }

    /// Move a server's config directory into the trash bin, suffixed with the
    /// current timestamp. Returns the trashed path, or `None` when there was
    /// nothing to trash.
    pub fn trash_server(&self, instance_name: &str) -> Result<Option<PathBuf>> {
        let server_dir = self.server_dir(instance_name);
        if !server_dir.exists() {
            return Ok(None);
        }
        let trash_dir = self.trashed_servers_dir();
        fs::create_dir_all(&trash_dir)?;
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        let target = trash_dir.join(format!("{instance_name}.{timestamp}"));
        fs::rename(&server_dir, &target)?;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config(name: &str) -> ServerConfig {
        ServerConfig {
            instance_name: name.to_string(),
            platform: Platform::Desktop,
            infra_name: crate::DEFAULT_INFRA.to_string(),
            mount_mode: MountMode::Quick,
            image: "datalab/notebook:latest".to_string(),
            gpu_enabled: false,
            cpu_limit: 4,
            memory_limit: 8 * 1024 * 1024 * 1024,
        }
    }

    #[test]
    fn server_config_round_trips() {
        let dir = tempdir().unwrap();
        let root = ConfigRoot::at(dir.path());

        let config = sample_config("unit");
        root.save_server_config(&config).unwrap();
        assert!(root.server_config_exists("unit"));

        let loaded = root.load_server_config("unit").unwrap();
        assert_eq!(loaded.instance_name, "unit");
        assert_eq!(loaded.mount_mode, MountMode::Quick);
        assert_eq!(loaded.cpu_limit, 4);
    }

    #[test]
    fn load_missing_config_is_not_found() {
        let dir = tempdir().unwrap();
        let root = ConfigRoot::at(dir.path());
        assert!(matches!(
            root.load_server_config("ghost"),
            Err(DatalabError::NotFound(_))
        ));
    }

    #[test]
    fn trash_moves_config_dir_with_timestamp_suffix() {
        let dir = tempdir().unwrap();
        let root = ConfigRoot::at(dir.path());
        root.save_server_config(&sample_config("doomed")).unwrap();

        let trashed = root.trash_server("doomed").unwrap().unwrap();
        assert!(!root.server_config_exists("doomed"));
        assert!(trashed.exists());
        let file_name = trashed.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("doomed."));
        assert!(trashed.join("server.json").exists());
    }

    #[test]
    fn trash_of_absent_server_is_a_noop() {
        let dir = tempdir().unwrap();
        let root = ConfigRoot::at(dir.path());
        assert!(root.trash_server("ghost").unwrap().is_none());
    }
}
