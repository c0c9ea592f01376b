use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use datalab_common::{ConfigRoot, DatalabError};
use datalab_orgs::{OrgManager, SystemGit};

mod commands;

#[derive(Parser)]
#[command(
    name = "datalab",
    version,
    about = "Disposable containerized development environments for data-science work"
)]
struct Cli {
    /// Display verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    subject: Subject,
}

#[derive(Subcommand)]
enum Subject {
    /// Manage server instances
    Server {
        #[command(subcommand)]
        action: commands::server::ServerAction,
    },
    /// Manage organization packages
    Org {
        #[command(subcommand)]
        action: commands::org::OrgAction,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), DatalabError> {
    let store = ConfigRoot::from_home()?;
    let orgs = OrgManager::new(store.clone(), std::sync::Arc::new(SystemGit));
    match cli.subject {
        Subject::Server { action } => commands::server::run(action, &store, &orgs).await,
        Subject::Org { action } => commands::org::run(action, &orgs).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        // Known error classes become a single human-readable line; the full
        // detail is only visible at debug verbosity.
        tracing::debug!("{err:?}");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
