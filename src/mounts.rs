use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use nix::sys::stat::stat;
use tokio::process::Command;
use tracing::{debug, warn};

const FUSERMOUNT: &str = "fusermount3";

/// Lazy, quiet unmount of a FUSE mount point. Fails only if the helper
/// exits nonzero.
pub async fn unmount(path: &Path) -> Result<()> {
    let status = Command::new(FUSERMOUNT)
        .args(["-u", "-z", "-q"])
        .arg(path)
        .status()
        .await
        .with_context(|| format!("spawning {FUSERMOUNT}"))?;
    if !status.success() {
        bail!("{FUSERMOUNT} -u {} failed: {status}", path.display());
    }
    Ok(())
}

/// Unmount every mount whose parent directory is `envroot`. This is the
/// recovery step for ENVFS mounts left behind by an unclean shutdown.
pub async fn sweep_stale(envroot: &Path) -> Result<()> {
    let envroot_st = stat(envroot).with_context(|| format!("stat {}", envroot.display()))?;
    let table = std::fs::read_to_string("/proc/self/mounts")?;
    for target in mount_points(&table) {
        let Some(parent) = target.parent() else {
            continue;
        };
        let parent_st = match stat(parent) {
            Ok(st) => st,
            Err(_) => continue,
        };
        if parent_st.st_dev == envroot_st.st_dev && parent_st.st_ino == envroot_st.st_ino {
            debug!(mount = %target.display(), "unmounting stale mount");
            if let Err(err) = unmount(&target).await {
                warn!(mount = %target.display(), ?err, "stale unmount failed");
            }
        }
    }
    Ok(())
}

/// Mount points (second field) of a mount table in /proc/self/mounts format.
fn mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_ascii_whitespace().nth(1))
        .map(PathBuf::from)
        .collect()
}
