//! Container-runtime collaborator: the narrow seam between the provisioning
//! state machine and Docker. Everything the rest of the crate needs from the
//! daemon goes through [`ContainerRuntime`], so tests can substitute an
//! in-memory fake.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig, Mount, MountTypeEnum, PortBinding, PortMap};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use datalab_common::{DatalabError, Result as CommonResult};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeClientError {
    #[error("Docker daemon unreachable: {0}")]
    DaemonUnreachable(#[source] BollardError),
    #[error("Docker rejected the request (status {status}): {source}")]
    Rejected {
        status: u16,
        #[source]
        source: BollardError,
    },
    #[error("Docker failed server-side (status {status}): {source}")]
    ServerSide {
        status: u16,
        #[source]
        source: BollardError,
    },
}

impl From<BollardError> for RuntimeClientError {
    fn from(err: BollardError) -> Self {
        match &err {
            BollardError::DockerResponseServerError { status_code, .. } => {
                let status = *status_code;
                if status < 500 {
                    RuntimeClientError::Rejected {
                        status,
                        source: err,
                    }
                } else {
                    RuntimeClientError::ServerSide {
                        status,
                        source: err,
                    }
                }
            }
            // Anything that never produced a daemon response: socket missing,
            // connection refused, serialization of the transport itself.
            _ => RuntimeClientError::DaemonUnreachable(err),
        }
    }
}

impl From<RuntimeClientError> for DatalabError {
    fn from(err: RuntimeClientError) -> Self {
        DatalabError::Runtime(err.to_string())
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn runtime_err(err: BollardError) -> DatalabError {
    RuntimeClientError::from(err).into()
}

/// Where a mount comes from on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Runtime-managed named volume.
    Volume,
    /// Host directory bind.
    Bind,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub kind: MountKind,
}

/// A container-internal port published on an allocated host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything needed to materialize a server container. Built once by the
/// provisioning state machine and passed by value.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub port_mappings: Vec<PortMapping>,
    /// Hard memory limit in bytes.
    pub memory_limit: i64,
    /// Soft memory reservation in bytes.
    pub memory_reservation: i64,
    pub nano_cpus: i64,
    pub shm_size: i64,
    /// Request all host GPUs when true.
    pub request_all_gpus: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn container_exists(&self, name: &str) -> CommonResult<bool>;
    /// Materialize the container. Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> CommonResult<()>;
    async fn start_container(&self, name: &str) -> CommonResult<()>;
    async fn stop_container(&self, name: &str) -> CommonResult<()>;
    /// Idempotent: absent containers are not an error.
    async fn remove_container(&self, name: &str) -> CommonResult<()>;
    /// Privileged exec as root, stdout and stderr captured separately.
    async fn exec(&self, name: &str, cmd: &[&str]) -> CommonResult<ExecOutput>;
    /// Host port bound to `container_port`, if published.
    async fn host_port_for(&self, name: &str, container_port: u16) -> CommonResult<Option<u16>>;
    async fn container_labels(&self, name: &str) -> CommonResult<HashMap<String, String>>;
    /// Create-if-absent. Returns true when the volume was created.
    async fn ensure_volume(&self, name: &str) -> CommonResult<bool>;
    /// Idempotent: absent volumes are not an error.
    async fn remove_volume(&self, name: &str) -> CommonResult<()>;
    async fn pull_image(&self, image: &str) -> CommonResult<()>;
}

// --- DockerRuntime Implementation ---

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> CommonResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_exists(&self, name: &str) -> CommonResult<bool> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> CommonResult<()> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for mapping in &spec.port_mappings {
            let key = format!("{}/tcp", mapping.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(match m.kind {
                    MountKind::Volume => MountTypeEnum::VOLUME,
                    MountKind::Bind => MountTypeEnum::BIND,
                }),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            memory: Some(spec.memory_limit),
            memory_reservation: Some(spec.memory_reservation),
            nano_cpus: Some(spec.nano_cpus),
            shm_size: Some(spec.shm_size),
            device_requests: if spec.request_all_gpus {
                Some(vec![DeviceRequest {
                    count: Some(-1),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }])
            } else {
                None
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        match self
            .docker
            .create_container(options.clone(), config.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                // Image missing locally: pull, then retry once.
                info!(image = %spec.image, "Image not found locally, pulling");
                self.pull_image(&spec.image).await?;
                self.docker
                    .create_container(options, config)
                    .await
                    .map_err(runtime_err)?;
                Ok(())
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn start_container(&self, name: &str) -> CommonResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn stop_container(&self, name: &str) -> CommonResult<()> {
        self.docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
            .map_err(runtime_err)
    }

    async fn remove_container(&self, name: &str) -> CommonResult<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(container = name, "Remove: container already absent");
                Ok(())
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn exec(&self, name: &str, cmd: &[&str]) -> CommonResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some("root".to_string()),
                    privileged: Some(true),
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(runtime_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(runtime_err)? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(runtime_err)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn host_port_for(&self, name: &str, container_port: u16) -> CommonResult<Option<u16>> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_err)?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        let wanted = format!("{container_port}/tcp");
        let bound = ports
            .get(&wanted)
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.as_ref())
            .and_then(|port| port.parse::<u16>().ok());
        Ok(bound)
    }

    async fn container_labels(&self, name: &str) -> CommonResult<HashMap<String, String>> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_err)?;
        Ok(inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default())
    }

    async fn ensure_volume(&self, name: &str) -> CommonResult<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(false),
            Err(e) if is_not_found(&e) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(runtime_err)?;
                Ok(true)
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn remove_volume(&self, name: &str) -> CommonResult<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(volume = name, "Remove: volume already absent");
                Ok(())
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> CommonResult<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        // Aggregate byte progress across layers so large pulls stay observable.
        let mut layer_progress: HashMap<String, (i64, i64)> = HashMap::new();
        let mut last_reported: i64 = 0;
        while let Some(update) = stream.next().await {
            let info = update.map_err(runtime_err)?;
            if let (Some(id), Some(detail)) = (info.id, info.progress_detail) {
                let entry = layer_progress.entry(id).or_insert((0, 0));
                if let Some(current) = detail.current {
                    entry.0 = current;
                }
                if let Some(total) = detail.total {
                    entry.1 = total;
                }
                let current_sum: i64 = layer_progress.values().map(|(c, _)| c).sum();
                let total_sum: i64 = layer_progress.values().map(|(_, t)| t).sum();
                // Report at most once per 64 MiB of progress.
                if current_sum - last_reported > 64 * 1024 * 1024 {
                    last_reported = current_sum;
                    info!(image, current_sum, total_sum, "Pulling image");
                }
            }
        }
        info!(image, "Image pull complete");
        Ok(())
    }
}
