use clap::Subcommand;

use datalab_common::Result;
use datalab_orgs::OrgManager;

#[derive(Subcommand)]
pub enum OrgAction {
    /// Install an organization package from a git reference
    Install {
        /// Git url of the organization's package
        #[arg(long)]
        gitref: String,
    },
    /// Update an installed organization package (all of them when no name is given)
    Update {
        /// Name of the organization to update
        #[arg(long)]
        name: Option<String>,
        /// Update even when the package was refreshed recently
        #[arg(long)]
        force: bool,
    },
    /// List installed organizations and their command surfaces
    List,
}

pub async fn run(action: OrgAction, orgs: &OrgManager) -> Result<()> {
    match action {
        OrgAction::Install { gitref } => orgs.install_from_git(&gitref).await,
        OrgAction::Update { name, force } => orgs.update(name.as_deref(), force).await,
        OrgAction::List => {
            for org in orgs.list_orgs()? {
                println!("Organization: {}", org.name);
                for body in &org.manifest.cli_bodies {
                    let platforms = body.platform_names.join("|");
                    println!("{}_{}_[{platforms}]", org.name, body.boundary_name);
                }
            }
            Ok(())
        }
    }
}
