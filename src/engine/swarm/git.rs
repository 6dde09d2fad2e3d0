// Git branch plumbing for swarm agents, via the `git` CLI as a
// subprocess. Branches are created off the swarm's base without touching
// the working tree; merges are sequential and stop at the first conflict.

use crate::atoms::error::{DaemonError, DaemonResult};
use log::info;
use std::path::Path;
use tokio::process::Command;

async fn git(working_dir: &str, args: &[&str]) -> DaemonResult<String> {
    if !Path::new(working_dir).is_dir() {
        return Err(DaemonError::Validation(format!(
            "working directory does not exist: {working_dir}"
        )));
    }
    let output = Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DaemonError::Other(format!(
            "git {} failed: {stderr}",
            args.first().unwrap_or(&"")
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Create `branch` off `base` without checking it out. Already-existing
/// branches are left as they are.
pub async fn create_branch(working_dir: &str, base: &str, branch: &str) -> DaemonResult<()> {
    if git(working_dir, &["rev-parse", "--verify", branch]).await.is_ok() {
        info!("[git] Branch '{branch}' already exists");
        return Ok(());
    }
    git(working_dir, &["branch", branch, base]).await?;
    info!("[git] Created branch '{branch}' off '{base}'");
    Ok(())
}

/// Merge `branch` into `target` (checking out `target` first). A conflict
/// aborts the merge and surfaces as an error so the caller can stop the
/// sequence and report it.
pub async fn merge_branch(working_dir: &str, target: &str, branch: &str) -> DaemonResult<()> {
    git(working_dir, &["checkout", target]).await?;
    match git(
        working_dir,
        &["merge", "--no-ff", "--no-edit", branch],
    )
    .await
    {
        Ok(_) => {
            info!("[git] Merged '{branch}' into '{target}'");
            Ok(())
        }
        Err(e) => {
            // Leave the tree clean for the next attempt.
            let _ = git(working_dir, &["merge", "--abort"]).await;
            Err(e)
        }
    }
}
