//! Explicit plugin registry.
//!
//! A process-wide table maps each infrastructure name to an ordered provider
//! list. Built-in infrastructures are seeded with the reserved `self`
//! provider; discovered plugins are appended in discovery order. Resolution
//! takes the last provider, so the most recently discovered plugin wins and
//! `self` only serves names no plugin ever claimed. The same
//! last-registration-wins rule applies to organization command overrides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use datalab_common::{DatalabError, Platform, Result};

use crate::manager::OrgPackage;

/// Required name prefix for discoverable infra plugins.
pub const PLUGIN_NAME_PREFIX: &str = "datalab_plugin";

/// Creation spec handed to a plugin's creation handler as JSON on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCreateRequest {
    pub instance_name: String,
    pub infra_name: String,
    pub platform: Platform,
    pub gpu_enabled: bool,
    pub image: Option<String>,
}

/// The defined contract an infrastructure plugin implements.
#[async_trait]
pub trait InfraPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn supported_infras(&self) -> &[String];
    /// Owns the entire creation of a server on its infrastructure.
    async fn create_server(&self, request: &PluginCreateRequest) -> Result<()>;
}

/// A plugin whose creation handler is an executable shipped inside the
/// organization package.
pub struct CommandPlugin {
    name: String,
    infras: Vec<String>,
    command: Vec<String>,
    org_dir: PathBuf,
}

#[async_trait]
impl InfraPlugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_infras(&self) -> &[String] {
        &self.infras
    }

    async fn create_server(&self, request: &PluginCreateRequest) -> Result<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| DatalabError::Org(format!("cannot serialize plugin request: {e}")))?;

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .current_dir(&self.org_dir)
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(DatalabError::Org(format!(
                "plugin '{}' create handler exited with {status}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Resolved owner of an infrastructure name.
#[derive(Clone)]
pub enum Resolution {
    /// The built-in provisioner (`self`).
    BuiltIn,
    Plugin(Arc<dyn InfraPlugin>),
}

#[derive(Clone)]
enum RegisteredProvider {
    BuiltIn,
    Plugin(Arc<dyn InfraPlugin>),
}

#[derive(Default)]
pub struct PluginRegistry {
    providers: HashMap<String, Vec<RegisteredProvider>>,
}

impl PluginRegistry {
    /// Registry seeded with the `self` provider for each built-in infra.
    pub fn with_builtin_infras(infras: &[&str]) -> Self {
        let mut registry = Self::default();
        for infra in infras {
            registry
                .providers
                .entry(infra.to_string())
                .or_default()
                .push(RegisteredProvider::BuiltIn);
        }
        registry
    }

    /// Append a plugin for every infra it claims. Later registrations win.
    pub fn register_plugin(&mut self, plugin: Arc<dyn InfraPlugin>) {
        for infra in plugin.supported_infras() {
            self.providers
                .entry(infra.clone())
                .or_default()
                .push(RegisteredProvider::Plugin(Arc::clone(&plugin)));
        }
    }

    /// Register plugins declared by installed organization packages, in
    /// package order. Entries that fail validation are skipped; a broken
    /// plugin must never take the rest of the CLI down.
    pub fn discover(&mut self, orgs: &[OrgPackage]) {
        for org in orgs {
            for entry in &org.manifest.plugins {
                if !entry.name.starts_with(PLUGIN_NAME_PREFIX) {
                    debug!(
                        org = org.name,
                        plugin = entry.name,
                        "Plugin name lacks the required prefix, skipping"
                    );
                    continue;
                }
                if entry.supported_infras.is_empty() || entry.command.is_empty() {
                    debug!(
                        org = org.name,
                        plugin = entry.name,
                        "Plugin entry incomplete, skipping"
                    );
                    continue;
                }
                self.register_plugin(Arc::new(CommandPlugin {
                    name: entry.name.clone(),
                    infras: entry.supported_infras.clone(),
                    command: entry.command.clone(),
                    org_dir: org.path.clone(),
                }));
            }
        }
    }

    /// Owner of `infra_name`: the most recently registered provider.
    pub fn resolve(&self, infra_name: &str) -> Result<Resolution> {
        match self.providers.get(infra_name).and_then(|p| p.last()) {
            Some(RegisteredProvider::BuiltIn) => Ok(Resolution::BuiltIn),
            Some(RegisteredProvider::Plugin(plugin)) => {
                Ok(Resolution::Plugin(Arc::clone(plugin)))
            }
            None => Err(DatalabError::UnsupportedInfra(format!(
                "no provider registered for infrastructure '{infra_name}'"
            ))),
        }
    }

    /// All registered infra names, for diagnostics.
    pub fn infra_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A command-surface override contributed by an organization.
#[derive(Debug, Clone)]
pub struct CommandOverride {
    pub org_name: String,
    pub boundary_name: String,
    pub command: Vec<String>,
    pub org_dir: PathBuf,
}

/// Map of built-in subject name to the organization body replacing it. When
/// several bodies override the same subject, the last one loaded wins.
pub fn command_overrides(orgs: &[OrgPackage]) -> HashMap<String, CommandOverride> {
    let mut overrides = HashMap::new();
    for org in orgs {
        for body in &org.manifest.cli_bodies {
            let Some(subject) = body.overrides.as_ref() else {
                continue;
            };
            let Some(command) = body.command.as_ref().filter(|c| !c.is_empty()) else {
                debug!(
                    org = org.name,
                    boundary = body.boundary_name,
                    "Override body has no command, skipping"
                );
                continue;
            };
            overrides.insert(
                subject.clone(),
                CommandOverride {
                    org_name: org.name.clone(),
                    boundary_name: body.boundary_name.clone(),
                    command: command.clone(),
                    org_dir: org.path.clone(),
                },
            );
        }
    }
    overrides
}
