//! Provisioning state machine for server instances:
//! `Absent -> Created -> Running <-> Stopped -> Removed`.
//!
//! Creation only materializes the container; nothing here starts it as a
//! side effect. All runtime interaction goes through the
//! [`ContainerRuntime`] seam.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use datalab_common::{
    ConfigRoot, DatalabError, MountMode, Platform, Result, ServerConfig, LABEL_INFRA,
    LABEL_PLATFORM,
};

use crate::netinfo;
use crate::ports;
use crate::probe::{extract_protocol, ProbeConfig, ReadinessProber};
use crate::runtime::{ContainerRuntime, ContainerSpec, MountKind, MountSpec};
use crate::sizing;

/// Notebook image without GPU support.
pub const IMAGE_CPU: &str = "datalab/notebook";
/// CUDA-enabled notebook image.
pub const IMAGE_GPU: &str = "datalab/notebook-cuda";

const MOUNT_DATA: &str = "/data";
const MOUNT_WORK: &str = "/home/jovyan/work";
const MOUNT_TMP: &str = "/tmp";

const SHM_SIZE: i64 = 512 * 1024 * 1024;

/// Image variant selector for `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Cpu,
    Gpu,
}

/// The 2x2 image matrix over (gpu, experimental).
pub fn image_reference(gpu: bool, experimental: bool) -> String {
    let base = if gpu { IMAGE_GPU } else { IMAGE_CPU };
    let tag = if experimental { "experimental" } else { "latest" };
    format!("{base}:{tag}")
}

/// Deterministic volume names owned by an instance: data, work, tmp.
pub fn volume_names(instance_name: &str) -> [String; 3] {
    [
        format!("jovyan-data-{instance_name}"),
        format!("jovyan-work-{instance_name}"),
        format!("jovyan-tmp-{instance_name}"),
    ]
}

/// Immutable creation parameters, built once by the caller.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub instance_name: String,
    pub platform: Platform,
    pub infra_name: String,
    pub mount_mode: MountMode,
    /// Basic mode: create data/work/tmp under `jovyan_root_path`.
    pub create_folders: bool,
    /// Basic mode with pre-existing folders: the caller's assertion that the
    /// three paths exist and are ready.
    pub folders_prepared: bool,
    pub jovyan_root_path: Option<PathBuf>,
    pub jovyan_data_path: Option<PathBuf>,
    pub jovyan_work_path: Option<PathBuf>,
    pub jovyan_tmp_path: Option<PathBuf>,
    pub gpu_enabled: bool,
    pub experimental: bool,
    /// Explicit image override; wins over the 2x2 matrix.
    pub image: Option<String>,
    /// Explicit CPU core limit; wins over the host-derived default.
    pub cpu_limit: Option<i64>,
    /// Explicit memory limit in bytes; wins over the host-derived default.
    pub memory_limit: Option<i64>,
    /// Soft memory reservation in bytes.
    pub memory_reservation: Option<i64>,
    /// Run the notebook without token protection.
    pub insecure: bool,
}

impl CreateOptions {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            platform: Platform::Desktop,
            infra_name: datalab_common::DEFAULT_INFRA.to_string(),
            mount_mode: MountMode::Quick,
            create_folders: true,
            folders_prepared: false,
            jovyan_root_path: None,
            jovyan_data_path: None,
            jovyan_work_path: None,
            jovyan_tmp_path: None,
            gpu_enabled: false,
            experimental: false,
            image: None,
            cpu_limit: None,
            memory_limit: None,
            memory_reservation: None,
            insecure: false,
        }
    }
}

/// Outcome of a successful `start`, ready for user-facing reporting.
#[derive(Debug, Clone)]
pub struct StartedServer {
    pub instance_name: String,
    pub platform: Platform,
    pub host_port: u16,
    /// Reachability attempts spent before the port answered.
    pub attempts: u32,
    /// Fully composed access URL; `None` when log scraping found nothing.
    pub access_url: Option<String>,
    pub token: Option<String>,
}

pub struct ServerManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: ConfigRoot,
    http: reqwest::Client,
    probe_config: ProbeConfig,
}

impl ServerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: ConfigRoot) -> Self {
        Self {
            runtime,
            store,
            http: reqwest::Client::new(),
            probe_config: ProbeConfig::default(),
        }
    }

    pub fn with_probe_config(mut self, config: ProbeConfig) -> Self {
        self.probe_config = config;
        self
    }

    /// Materialize a new server container. Fails with `AlreadyExists` when a
    /// container with this instance name is present in any state.
    pub async fn create(&self, opts: &CreateOptions) -> Result<()> {
        let name = &opts.instance_name;
        if self.runtime.container_exists(name).await? {
            return Err(DatalabError::AlreadyExists(format!(
                "server '{name}' already exists, remove it before creating again"
            )));
        }

        let image = opts
            .image
            .clone()
            .unwrap_or_else(|| image_reference(opts.gpu_enabled, opts.experimental));

        let mounts = match opts.mount_mode {
            MountMode::Quick => self.prepare_quick_mode(name).await?,
            MountMode::Basic => self.prepare_basic_mode(opts)?,
        };

        let cpu_limit = opts
            .cpu_limit
            .unwrap_or_else(|| sizing::default_cpu_limit() as i64);
        let memory_limit = opts
            .memory_limit
            .unwrap_or_else(|| sizing::default_memory_limit() as i64);
        let memory_reservation = opts.memory_reservation.unwrap_or(memory_limit / 2);

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            command: notebook_command(opts.insecure),
            working_dir: MOUNT_WORK.to_string(),
            env: vec![
                "DSML_USER=jovyan".to_string(),
                "JUPYTER_ALLOW_INSECURE_WRITES=true".to_string(),
                format!("JUPYTER_RUNTIME_DIR={MOUNT_TMP}"),
                format!("INFRA_NAME={}", opts.infra_name),
                format!("DATALAB_IMAGE={image}"),
                format!("CPU_LIMIT={cpu_limit}"),
                format!("MEM_LIMIT={memory_limit}"),
            ],
            labels: HashMap::from([
                (LABEL_PLATFORM.to_string(), opts.platform.to_string()),
                (LABEL_INFRA.to_string(), opts.infra_name.clone()),
            ]),
            mounts,
            port_mappings: ports::ports_mapping(),
            memory_limit,
            memory_reservation,
            nano_cpus: cpu_limit * 1_000_000_000,
            shm_size: SHM_SIZE,
            request_all_gpus: opts.gpu_enabled,
        };

        self.runtime.create_container(&spec).await?;

        self.store.save_server_config(&ServerConfig {
            instance_name: name.clone(),
            platform: opts.platform,
            infra_name: opts.infra_name.clone(),
            mount_mode: opts.mount_mode,
            image,
            gpu_enabled: opts.gpu_enabled,
            cpu_limit,
            memory_limit,
        })?;

        info!("Server {name} created");
        Ok(())
    }

    async fn prepare_quick_mode(&self, instance_name: &str) -> Result<Vec<MountSpec>> {
        let [data, work, tmp] = volume_names(instance_name);
        for volume in [&data, &work, &tmp] {
            if self.runtime.ensure_volume(volume).await? {
                info!("Created volume {volume}");
            } else {
                info!("Volume {volume} is found, reusing it");
            }
        }
        Ok(vec![
            volume_mount(data, MOUNT_DATA),
            volume_mount(work, MOUNT_WORK),
            volume_mount(tmp, MOUNT_TMP),
        ])
    }

    fn prepare_basic_mode(&self, opts: &CreateOptions) -> Result<Vec<MountSpec>> {
        let (data, work, tmp) = if opts.create_folders {
            let root = opts.jovyan_root_path.as_ref().ok_or_else(|| {
                DatalabError::FolderPreparation(
                    "basic mode with folder creation needs a jovyan root path".to_string(),
                )
            })?;
            let data = root.join("data");
            let work = root.join("work");
            let tmp = root.join("tmp");
            info!("Creating work folders under {}", root.display());
            fs::create_dir_all(&data)?;
            fs::create_dir_all(&work)?;
            fs::create_dir_all(&tmp)?;
            (data, work, tmp)
        } else {
            let missing = || {
                DatalabError::FolderPreparation(
                    "basic mode needs explicit data, work and tmp paths".to_string(),
                )
            };
            let data = opts.jovyan_data_path.clone().ok_or_else(missing)?;
            let work = opts.jovyan_work_path.clone().ok_or_else(missing)?;
            let tmp = opts.jovyan_tmp_path.clone().ok_or_else(missing)?;
            if !opts.folders_prepared {
                return Err(DatalabError::FolderPreparation(
                    "the data, work and tmp folders must be prepared beforehand".to_string(),
                ));
            }
            (data, work, tmp)
        };

        Ok(vec![
            bind_mount(&data, MOUNT_DATA),
            bind_mount(&work, MOUNT_WORK),
            bind_mount(&tmp, MOUNT_TMP),
        ])
    }

    /// Start a created server, wait for it to answer, and resolve its access
    /// URL. The notebook user must own the mount points before the service
    /// can write to them, and a stale tmp mount confuses the notebook's
    /// runtime directory, so both are normalized right after start.
    pub async fn start(&self, instance_name: &str) -> Result<StartedServer> {
        if !self.runtime.container_exists(instance_name).await? {
            return Err(DatalabError::NotFound(format!(
                "server '{instance_name}' does not exist yet, create it first"
            )));
        }

        info!("Starting server {instance_name}...");
        self.runtime.start_container(instance_name).await?;
        self.prepare_mounted_folders(instance_name).await?;

        let host_port = self
            .runtime
            .host_port_for(instance_name, ports::NOTEBOOK_PORT)
            .await?
            .ok_or_else(|| {
                DatalabError::Readiness(format!(
                    "server '{instance_name}' has no published notebook port"
                ))
            })?;

        let prober =
            ReadinessProber::with_config(Arc::clone(&self.runtime), self.probe_config.clone());
        let state = prober
            .probe(instance_name, &format!("http://127.0.0.1:{host_port}"))
            .await?;

        let platform = self.server_platform(instance_name).await?;
        let access_url = match &state.url {
            Some(url) => {
                let protocol = extract_protocol(url).unwrap_or("http");
                let ip = netinfo::display_ip(platform, &self.http).await;
                let token_query = state
                    .token
                    .as_ref()
                    .map(|t| format!("?token={t}"))
                    .unwrap_or_default();
                Some(format!("{protocol}://{ip}:{host_port}/{token_query}"))
            }
            None => None,
        };

        Ok(StartedServer {
            instance_name: instance_name.to_string(),
            platform,
            host_port,
            attempts: state.attempts,
            access_url,
            token: state.token,
        })
    }

    async fn prepare_mounted_folders(&self, instance_name: &str) -> Result<()> {
        for target in [MOUNT_TMP, MOUNT_DATA, MOUNT_WORK] {
            self.runtime
                .exec(instance_name, &["chown", "-R", "jovyan:users", target])
                .await?;
        }
        self.runtime
            .exec(instance_name, &["sh", "-c", "rm -rf /tmp/*"])
            .await?;
        Ok(())
    }

    /// Platform the server was created for, read back from its labels.
    /// Servers from before labels were stamped are treated as desktop.
    async fn server_platform(&self, instance_name: &str) -> Result<Platform> {
        let labels = self.runtime.container_labels(instance_name).await?;
        match labels.get(LABEL_PLATFORM) {
            Some(value) => Ok(value.parse().unwrap_or_else(|_| {
                debug!(instance_name, value, "Unknown platform label");
                Platform::Desktop
            })),
            None => Ok(Platform::Desktop),
        }
    }

    pub async fn stop(&self, instance_name: &str) -> Result<()> {
        if !self.runtime.container_exists(instance_name).await? {
            return Err(DatalabError::NotFound(format!(
                "server '{instance_name}' does not exist"
            )));
        }
        self.runtime.stop_container(instance_name).await?;
        info!("Server {instance_name} stopped");
        Ok(())
    }

    /// Remove a server. Idempotent: removing an absent server only logs.
    pub async fn remove(&self, instance_name: &str, with_volumes: bool) -> Result<()> {
        if !self.runtime.container_exists(instance_name).await? {
            info!("Server {instance_name} has already been removed");
        }
        self.runtime.remove_container(instance_name).await?;

        if with_volumes {
            info!("Removing volumes of {instance_name}");
            for volume in volume_names(instance_name) {
                self.runtime.remove_volume(&volume).await?;
            }
        }

        if let Some(trashed) = self.store.trash_server(instance_name)? {
            debug!(instance_name, path = %trashed.display(), "Server config trashed");
        }

        info!("Server {instance_name} removed");
        Ok(())
    }

    /// Pull the newest image of the selected variant. Running instances are
    /// left untouched.
    pub async fn update(&self, kind: ImageKind, experimental: bool) -> Result<()> {
        let image = image_reference(kind == ImageKind::Gpu, experimental);
        self.runtime.pull_image(&image).await?;
        info!("Server image {image} updated");
        Ok(())
    }
}

fn notebook_command(insecure: bool) -> Vec<String> {
    let mut command: Vec<String> = [
        "start-notebook.sh",
        "--ip=0.0.0.0",
        "--port=8888",
        "--NotebookApp.default_url=/lab",
        "--ServerApp.allow_password_change=False",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    if insecure {
        command.push("--NotebookApp.token=".to_string());
        command.push("--NotebookApp.password=".to_string());
    }
    command
}

fn volume_mount(source: String, target: &str) -> MountSpec {
    MountSpec {
        source,
        target: target.to_string(),
        kind: MountKind::Volume,
    }
}

fn bind_mount(source: &std::path::Path, target: &str) -> MountSpec {
    MountSpec {
        source: source.to_string_lossy().into_owned(),
        target: target.to_string(),
        kind: MountKind::Bind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecOutput;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockRuntime {
        containers: Mutex<HashSet<String>>,
        volumes: Mutex<HashSet<String>>,
        created_specs: Mutex<Vec<ContainerSpec>>,
        removed_containers: Mutex<Vec<String>>,
        removed_volumes: Mutex<Vec<String>>,
        pulled_images: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        fn with_container(name: &str) -> Self {
            let mock = Self::default();
            mock.containers.lock().unwrap().insert(name.to_string());
            mock
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn container_exists(&self, name: &str) -> Result<bool> {
            Ok(self.containers.lock().unwrap().contains(name))
        }
        async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
            self.containers.lock().unwrap().insert(spec.name.clone());
            self.created_specs.lock().unwrap().push(spec.clone());
            Ok(())
        }
        async fn start_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, name: &str) -> Result<()> {
            self.containers.lock().unwrap().remove(name);
            self.removed_containers.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn exec(&self, _: &str, _: &[&str]) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
        async fn host_port_for(&self, _: &str, _: u16) -> Result<Option<u16>> {
            Ok(Some(18888))
        }
        async fn container_labels(&self, _: &str) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn ensure_volume(&self, name: &str) -> Result<bool> {
            Ok(self.volumes.lock().unwrap().insert(name.to_string()))
        }
        async fn remove_volume(&self, name: &str) -> Result<()> {
            self.volumes.lock().unwrap().remove(name);
            self.removed_volumes.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn pull_image(&self, image: &str) -> Result<()> {
            self.pulled_images.lock().unwrap().push(image.to_string());
            Ok(())
        }
    }

    fn manager(runtime: Arc<MockRuntime>, root: &std::path::Path) -> ServerManager {
        ServerManager::new(runtime, ConfigRoot::at(root))
    }

    #[test]
    fn image_matrix_covers_all_variants() {
        assert_eq!(image_reference(false, false), "datalab/notebook:latest");
        assert_eq!(image_reference(true, false), "datalab/notebook-cuda:latest");
        assert_eq!(image_reference(false, true), "datalab/notebook:experimental");
        assert_eq!(
            image_reference(true, true),
            "datalab/notebook-cuda:experimental"
        );
    }

    #[tokio::test]
    async fn create_rejects_duplicate_instance_name() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::with_container("dup"));
        let mgr = manager(Arc::clone(&runtime), dir.path());

        let err = mgr.create(&CreateOptions::new("dup")).await.unwrap_err();
        assert!(matches!(err, DatalabError::AlreadyExists(_)));
        assert!(runtime.created_specs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quick_mode_provisions_named_volumes_and_persists_config() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.create(&CreateOptions::new("unit")).await.unwrap();

        let volumes = runtime.volumes.lock().unwrap();
        for expected in volume_names("unit") {
            assert!(volumes.contains(&expected), "missing volume {expected}");
        }

        let specs = runtime.created_specs.lock().unwrap();
        let spec = &specs[0];
        assert_eq!(spec.image, "datalab/notebook:latest");
        assert!(!spec.request_all_gpus);
        assert_eq!(spec.labels.get(LABEL_PLATFORM).unwrap(), "desktop");
        assert_eq!(
            spec.labels.get(LABEL_INFRA).unwrap(),
            datalab_common::DEFAULT_INFRA
        );
        assert!(spec
            .env
            .iter()
            .any(|e| e == &format!("INFRA_NAME={}", datalab_common::DEFAULT_INFRA)));
        assert!(spec
            .port_mappings
            .iter()
            .any(|m| m.container_port == ports::NOTEBOOK_PORT));
        assert!(spec.mounts.iter().all(|m| m.kind == MountKind::Volume));

        let config = ConfigRoot::at(dir.path()).load_server_config("unit").unwrap();
        assert_eq!(config.image, "datalab/notebook:latest");
        assert_eq!(config.mount_mode, MountMode::Quick);
    }

    #[tokio::test]
    async fn creating_twice_reuses_existing_volumes() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.create(&CreateOptions::new("unit")).await.unwrap();
        mgr.remove("unit", false).await.unwrap();
        mgr.create(&CreateOptions::new("unit")).await.unwrap();

        // Three volumes total, not six.
        assert_eq!(runtime.volumes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn basic_mode_creates_folders_under_root() {
        let dir = tempdir().unwrap();
        let jovyan_root = dir.path().join("jovyan");
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        let mut opts = CreateOptions::new("basic");
        opts.mount_mode = MountMode::Basic;
        opts.jovyan_root_path = Some(jovyan_root.clone());
        mgr.create(&opts).await.unwrap();

        assert!(jovyan_root.join("data").is_dir());
        assert!(jovyan_root.join("work").is_dir());
        assert!(jovyan_root.join("tmp").is_dir());

        let specs = runtime.created_specs.lock().unwrap();
        assert!(specs[0].mounts.iter().all(|m| m.kind == MountKind::Bind));
    }

    #[tokio::test]
    async fn basic_mode_rejects_unprepared_folders() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(runtime, dir.path());

        let mut opts = CreateOptions::new("basic");
        opts.mount_mode = MountMode::Basic;
        opts.create_folders = false;
        opts.jovyan_data_path = Some(dir.path().join("data"));
        opts.jovyan_work_path = Some(dir.path().join("work"));
        opts.jovyan_tmp_path = Some(dir.path().join("tmp"));
        opts.folders_prepared = false;

        let err = mgr.create(&opts).await.unwrap_err();
        assert!(matches!(err, DatalabError::FolderPreparation(_)));
    }

    #[tokio::test]
    async fn explicit_limits_take_precedence() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        let mut opts = CreateOptions::new("sized");
        opts.cpu_limit = Some(2);
        opts.memory_limit = Some(4 * 1024 * 1024 * 1024);
        mgr.create(&opts).await.unwrap();

        let specs = runtime.created_specs.lock().unwrap();
        assert_eq!(specs[0].nano_cpus, 2_000_000_000);
        assert_eq!(specs[0].memory_limit, 4 * 1024 * 1024 * 1024);
        assert_eq!(specs[0].memory_reservation, 2 * 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::with_container("gone"));
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.remove("gone", false).await.unwrap();
        mgr.remove("gone", false).await.unwrap();
        assert!(!runtime.containers.lock().unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn remove_with_volumes_drops_all_three() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.create(&CreateOptions::new("vols")).await.unwrap();
        mgr.remove("vols", true).await.unwrap();

        let removed = runtime.removed_volumes.lock().unwrap();
        for expected in volume_names("vols") {
            assert!(removed.contains(&expected), "volume {expected} not removed");
        }
    }

    #[tokio::test]
    async fn remove_trashes_persisted_config() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.create(&CreateOptions::new("trashed")).await.unwrap();
        mgr.remove("trashed", false).await.unwrap();

        let root = ConfigRoot::at(dir.path());
        assert!(!root.server_config_exists("trashed"));
        let trashed: Vec<_> = std::fs::read_dir(root.trashed_servers_dir())
            .unwrap()
            .collect();
        assert_eq!(trashed.len(), 1);
    }

    #[tokio::test]
    async fn stop_and_start_of_absent_server_are_not_found() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(runtime, dir.path());

        assert!(matches!(
            mgr.stop("ghost").await.unwrap_err(),
            DatalabError::NotFound(_)
        ));
        assert!(matches!(
            mgr.start("ghost").await.unwrap_err(),
            DatalabError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn update_pulls_the_selected_variant_only() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let mgr = manager(Arc::clone(&runtime), dir.path());

        mgr.update(ImageKind::Gpu, true).await.unwrap();

        let pulled = runtime.pulled_images.lock().unwrap();
        assert_eq!(pulled.as_slice(), ["datalab/notebook-cuda:experimental"]);
        assert!(runtime.containers.lock().unwrap().is_empty());
    }
}
