use std::path::PathBuf;
use std::sync::Arc;

use bytesize::ByteSize;
use clap::{ArgAction, Args, Subcommand, ValueEnum};
use tracing::{debug, info};

use datalab_common::{
    ConfigRoot, DatalabError, MountMode, Platform, Result, DEFAULT_INFRA,
};
use datalab_executor::{
    ContainerRuntime, CreateOptions, DockerRuntime, ImageKind, ServerManager, StartedServer,
};
use datalab_orgs::registry::CommandOverride;
use datalab_orgs::{command_overrides, OrgManager, PluginCreateRequest, PluginRegistry, Resolution};

const DEFAULT_INSTANCE: &str = "jovyan-single-use";

#[derive(Subcommand)]
pub enum ServerAction {
    /// Create a server
    Create(CreateArgs),
    /// Start a created server and report its access URL
    Start {
        /// Server container name
        #[arg(long, default_value = DEFAULT_INSTANCE)]
        instance_name: String,
    },
    /// Stop a running server
    Stop {
        /// Server container name
        #[arg(long, default_value = DEFAULT_INSTANCE)]
        instance_name: String,
    },
    /// Remove a server
    Remove {
        /// Server container name
        #[arg(long, default_value = DEFAULT_INSTANCE)]
        instance_name: String,
        /// Also remove the server's data, work and tmp volumes
        #[arg(long)]
        with_volumes: bool,
    },
    /// Pull the newest server image without touching running instances
    Update {
        /// Image variant to update
        #[arg(long, value_enum, default_value_t = ImageArg::Ml)]
        image: ImageArg,
        /// Update the experimental image line
        #[arg(long)]
        experimental: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ImageArg {
    /// CPU notebook image
    Ml,
    /// CUDA notebook image
    Cv,
}

impl From<ImageArg> for ImageKind {
    fn from(arg: ImageArg) -> Self {
        match arg {
            ImageArg::Ml => ImageKind::Cpu,
            ImageArg::Cv => ImageKind::Gpu,
        }
    }
}

#[derive(Args)]
pub struct CreateArgs {
    /// Server container name
    #[arg(long, default_value = DEFAULT_INSTANCE)]
    pub instance_name: String,

    /// Mount strategy: quick (named volumes) or basic (host folders)
    #[arg(long, default_value = "quick")]
    pub run_mode: MountMode,

    /// Host the server runs on: desktop or remote_vm
    #[arg(long, default_value = "desktop")]
    pub platform: Platform,

    /// Infrastructure name to use
    #[arg(long, default_value = DEFAULT_INFRA)]
    pub infra_name: String,

    /// Let the container use the host's GPUs
    #[arg(long)]
    pub gpu_enabled: bool,

    /// Use the experimental image line
    #[arg(long)]
    pub experimental: bool,

    /// Explicit image reference, overriding the gpu/experimental selection
    #[arg(long)]
    pub image: Option<String>,

    /// CPU core limit (default: host cores minus one)
    #[arg(long)]
    pub cpu_limit: Option<i64>,

    /// Memory limit, e.g. "8GiB" (default: host memory minus 2 GiB)
    #[arg(long)]
    pub memory_limit: Option<ByteSize>,

    /// Soft memory reservation, e.g. "4GiB"
    #[arg(long)]
    pub memory_reservation: Option<ByteSize>,

    /// Basic mode: create data, work and tmp under --jovyan-root-path
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub create_folders: bool,

    /// Basic mode with pre-existing folders: assert they are ready
    #[arg(long)]
    pub folders_prepared: bool,

    /// Parent folder for data, work and tmp (basic mode with folder creation)
    #[arg(long)]
    pub jovyan_root_path: Option<PathBuf>,

    /// Data folder on the host (basic mode)
    #[arg(long)]
    pub jovyan_data_path: Option<PathBuf>,

    /// Work folder on the host (basic mode)
    #[arg(long)]
    pub jovyan_work_path: Option<PathBuf>,

    /// Tmp folder on the host (basic mode)
    #[arg(long)]
    pub jovyan_tmp_path: Option<PathBuf>,

    /// Run the server without token protection
    #[arg(long)]
    pub insecure: bool,
}

impl CreateArgs {
    fn into_options(self) -> CreateOptions {
        let mut opts = CreateOptions::new(self.instance_name);
        opts.platform = self.platform;
        opts.infra_name = self.infra_name;
        opts.mount_mode = self.run_mode;
        opts.create_folders = self.create_folders;
        opts.folders_prepared = self.folders_prepared;
        opts.jovyan_root_path = self.jovyan_root_path;
        opts.jovyan_data_path = self.jovyan_data_path;
        opts.jovyan_work_path = self.jovyan_work_path;
        opts.jovyan_tmp_path = self.jovyan_tmp_path;
        opts.gpu_enabled = self.gpu_enabled;
        opts.experimental = self.experimental;
        opts.image = self.image;
        opts.cpu_limit = self.cpu_limit;
        opts.memory_limit = self.memory_limit.map(|b| b.as_u64() as i64);
        opts.memory_reservation = self.memory_reservation.map(|b| b.as_u64() as i64);
        opts.insecure = self.insecure;
        opts
    }
}

pub async fn run(action: ServerAction, store: &ConfigRoot, orgs: &OrgManager) -> Result<()> {
    let packages = orgs.list_orgs().unwrap_or_else(|e| {
        debug!("Cannot enumerate organizations: {e}");
        Vec::new()
    });

    // An organization body overriding the server subject owns the whole
    // command line, subcommands included.
    if let Some(body) = command_overrides(&packages).get("server") {
        return delegate_subject(body).await;
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let manager = ServerManager::new(runtime, store.clone());

    match action {
        ServerAction::Create(args) => {
            let mut registry = PluginRegistry::with_builtin_infras(&[DEFAULT_INFRA]);
            registry.discover(&packages);
            match registry.resolve(&args.infra_name)? {
                Resolution::Plugin(plugin) => {
                    info!(
                        "Infrastructure '{}' is owned by plugin '{}'",
                        args.infra_name,
                        plugin.name()
                    );
                    plugin
                        .create_server(&PluginCreateRequest {
                            instance_name: args.instance_name.clone(),
                            infra_name: args.infra_name.clone(),
                            platform: args.platform,
                            gpu_enabled: args.gpu_enabled,
                            image: args.image.clone(),
                        })
                        .await
                }
                Resolution::BuiltIn => manager.create(&args.into_options()).await,
            }
        }
        ServerAction::Start { instance_name } => {
            let started = manager.start(&instance_name).await?;
            report_started(&started);
            Ok(())
        }
        ServerAction::Stop { instance_name } => manager.stop(&instance_name).await,
        ServerAction::Remove {
            instance_name,
            with_volumes,
        } => manager.remove(&instance_name, with_volumes).await,
        ServerAction::Update {
            image,
            experimental,
        } => manager.update(image.into(), experimental).await,
    }
}

fn report_started(started: &StartedServer) {
    debug!(attempts = started.attempts, "Server answered the readiness probe");
    println!(
        "Server {} started, platform: {}",
        started.instance_name, started.platform
    );
    match (&started.access_url, started.platform) {
        (Some(url), Platform::Desktop) => {
            println!("Go to {url} to open jupyterlab");
        }
        (Some(url), _) => {
            println!("Detected server url {url}");
            println!("If the server is not accessible, find your public VM IP address manually");
        }
        (None, _) => {
            println!(
                "No access URL found in server logs; the server answers on port {}",
                started.host_port
            );
        }
    }
}

/// Re-run the current command line through an organization's handler.
async fn delegate_subject(body: &CommandOverride) -> Result<()> {
    info!(
        "Subject '{}' is overridden by organization '{}'",
        body.boundary_name, body.org_name
    );
    let mut command = tokio::process::Command::new(&body.command[0]);
    command
        .args(&body.command[1..])
        .args(std::env::args_os().skip(1))
        .current_dir(&body.org_dir);
    let status = command.status().await?;
    if !status.success() {
        return Err(DatalabError::Org(format!(
            "organization handler for '{}' exited with {status}",
            body.boundary_name
        )));
    }
    Ok(())
}
