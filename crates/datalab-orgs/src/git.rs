//! Version-control collaborator. Clone and pull shell out to the system git
//! under a hard wall-clock budget; an expired budget kills the child and
//! surfaces as `DatalabError::Timeout`, which callers treat as a soft
//! failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use datalab_common::{DatalabError, Result};

pub const CLONE_TIMEOUT: Duration = Duration::from_secs(60);
pub const PULL_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;
    async fn pull(&self, repo_dir: &Path) -> Result<()>;
}

pub struct SystemGit;

#[async_trait]
impl VersionControl for SystemGit {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        debug!(url, dest = %dest.display(), "git clone");
        let mut command = Command::new("git");
        command.arg("clone").arg(url).arg(dest);
        run_with_budget(command, CLONE_TIMEOUT, "git clone").await
    }

    async fn pull(&self, repo_dir: &Path) -> Result<()> {
        debug!(repo = %repo_dir.display(), "git pull");
        let mut command = Command::new("git");
        command.arg("-C").arg(repo_dir).arg("pull");
        run_with_budget(command, PULL_TIMEOUT, "git pull").await
    }
}

/// Run a subprocess under a wall-clock budget, killing it on expiry.
pub(crate) async fn run_with_budget(
    mut command: Command,
    budget: Duration,
    what: &str,
) -> Result<()> {
    command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = command.spawn()?;

    match timeout(budget, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(DatalabError::Org(format!("{what} exited with {status}"))),
        Ok(Err(e)) => Err(DatalabError::Io(e)),
        Err(_) => {
            child.kill().await.ok();
            Err(DatalabError::Timeout(format!(
                "{what} exceeded its {}s budget",
                budget.as_secs()
            )))
        }
    }
}
