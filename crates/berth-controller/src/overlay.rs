//! Overlay upper-directory preservation
//!
//! A version transition must not lose in-container changes: the old
//! container's overlay upper directory is copied into the new container's
//! before (patch/restart) or right after (rollback) the new one starts.
//!
//! The ballast stone is a 5 MiB placeholder written into every container
//! shortly after start. It guarantees the upper directory exists and is
//! non-empty, so the copy pipeline always has something to archive. It is
//! deleted from the old upper directory before the copy.

use berth_core::{Error, Result};
use berth_runtime::ContainerRuntime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Ballast path inside the container (and inside the upper directory)
pub const BALLAST_STONE: &str = "var/backups/ballaststone";

/// Copy the contents of `src` into `dest` through a tar pipeline,
/// preserving ownership and permissions
pub async fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    let command = format!(
        "(cd {}; tar c .) | (cd {}; tar x)",
        src.display(),
        dest.display()
    );
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await
        .map_err(|e| Error::internal(format!("overlay copy failed to spawn: {}", e)))?;
    if !status.success() {
        return Err(Error::internal(format!(
            "overlay copy exited with {}: {}",
            status, command
        )));
    }
    debug!(src = %src.display(), dest = %dest.display(), "overlay copied");
    Ok(())
}

/// The overlay upper directory of a container, from the runtime's graph
/// driver data
pub async fn upper_dir(runtime: &dyn ContainerRuntime, name: &str) -> Result<PathBuf> {
    let details = runtime.inspect(name).await?;
    if details.upper_dir.is_empty() {
        return Err(Error::internal(format!(
            "container {} has no upper directory",
            name
        )));
    }
    Ok(PathBuf::from(details.upper_dir))
}

/// Copy the old container's upper directory into the new container's
pub async fn copy_upper(
    runtime: &dyn ContainerRuntime,
    old_name: &str,
    new_name: &str,
) -> Result<()> {
    let old = upper_dir(runtime, old_name).await?;
    let new = upper_dir(runtime, new_name).await?;
    copy_dir(&old, &new).await?;
    info!(old = old_name, new = new_name, "upper directory carried over");
    Ok(())
}

/// Delete the ballast stone from a container's upper directory; absent is fine
pub async fn remove_ballast(runtime: &dyn ContainerRuntime, name: &str) -> Result<()> {
    let dir = upper_dir(runtime, name).await?;
    match std::fs::remove_file(dir.join(BALLAST_STONE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::internal(format!(
            "ballast stone removal failed for {}: {}",
            name, e
        ))),
    }
}

/// Write the ballast stone a few seconds after start, once the container's
/// filesystem is up
pub fn spawn_ballast_writer(runtime: Arc<dyn ContainerRuntime>, name: String) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let cmd = vec![
            "dd".to_string(),
            "if=/dev/zero".to_string(),
            format!("of=/{}", BALLAST_STONE),
            "bs=1M".to_string(),
            "count=5".to_string(),
        ];
        if let Err(e) = runtime.exec(&name, "/", &cmd).await {
            error!(container = %name, error = %e, "ballast stone write failed");
        }
    });
}
