//! The local vrnetlab checkout.

use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::config::CheckoutSettings;
use crate::error::Error;
use crate::preflight;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutStatus {
    Cloned,
    Updated,
    Unchanged,
}

/// Clone the build-system repository if missing, otherwise fast-forward it.
///
/// A failed clone is fatal; a failed update only warns.
pub fn ensure_checkout(settings: &CheckoutSettings) -> Result<CheckoutStatus, Error> {
    let dir = &settings.dir;
    let unavailable = |reason: String| Error::CheckoutUnavailable {
        path: dir.clone(),
        reason,
    };

    if !dir.exists() {
        preflight::check_required_tools(&[preflight::GIT]).map_err(|e| unavailable(e.to_string()))?;
        info!("cloning {} into {}", settings.repo_url, dir.display());
        let output = Command::new("git")
            .arg("clone")
            .arg(&settings.repo_url)
            .arg(dir)
            .output()
            .map_err(|e| unavailable(format!("running git clone: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable(format!("git clone failed: {}", stderr.trim())));
        }
        return Ok(CheckoutStatus::Cloned);
    }

    if !dir.is_dir() {
        return Err(unavailable("not a directory".to_string()));
    }
    if !settings.update || !dir.join(".git").exists() {
        return Ok(CheckoutStatus::Unchanged);
    }
    if !preflight::command_exists("git") {
        warn!("git not found; using {} as is", dir.display());
        return Ok(CheckoutStatus::Unchanged);
    }

    Ok(pull(dir))
}

fn pull(dir: &Path) -> CheckoutStatus {
    info!("updating {}", dir.display());
    match Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["pull", "--ff-only"])
        .output()
    {
        Ok(output) if output.status.success() => CheckoutStatus::Updated,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("git pull failed in {}: {}", dir.display(), stderr.trim());
            CheckoutStatus::Unchanged
        }
        Err(err) => {
            warn!("running git pull in {}: {err}", dir.display());
            CheckoutStatus::Unchanged
        }
    }
}
