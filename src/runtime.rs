use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

/// Label identifying containers that get an environment mount.
pub const TOOLBOX_LABEL_KEY: &str = "com.redhat.component";
pub const TOOLBOX_LABEL_VALUE: &str = "fedora-toolbox";

/// Container state enum value meaning "running".
const STATE_RUNNING: i64 = 3;

/// Immutable snapshot of one container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Init PID in the host namespace; zero when not running.
    pub pid: i32,
    pub eligible: bool,
}

#[derive(Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "Names")]
    names: Option<String>,
    #[serde(rename = "State")]
    state: Option<i64>,
    #[serde(rename = "Pid")]
    pid: Option<i32>,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Parse the runtime's `ps --format=json` output. Elements missing a
/// required field, or of the wrong shape entirely, are skipped.
pub fn parse_listing(output: &[u8]) -> Result<Vec<ContainerInfo>> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_slice(output).context("parsing container listing")?;
    let mut containers = Vec::new();
    for value in entries {
        let Ok(entry) = serde_json::from_value::<PsEntry>(value) else {
            continue;
        };
        let (Some(id), Some(name), Some(state), Some(pid)) =
            (entry.id, entry.names, entry.state, entry.pid)
        else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let eligible = entry
            .labels
            .as_ref()
            .and_then(|labels| labels.get(TOOLBOX_LABEL_KEY))
            .is_some_and(|value| value == TOOLBOX_LABEL_VALUE);
        containers.push(ContainerInfo {
            id,
            name,
            pid: if state == STATE_RUNNING { pid } else { 0 },
            eligible,
        });
    }
    Ok(containers)
}

/// The container runtime collaborator, driven entirely through its CLI.
pub struct Runtime {
    program: PathBuf,
}

impl Runtime {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let output = Command::new(&self.program)
            .args(["ps", "-a", "--format=json", "--no-trunc", "--namespace"])
            .output()
            .await
            .with_context(|| format!("running {}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "{} ps failed: {}",
                self.program.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let containers = parse_listing(&output.stdout)?;
        trace!(count = containers.len(), "listed containers");
        Ok(containers)
    }

    /// `start <name>` / `stop <name>`. The error is a plain message so the
    /// coalescing layer can hand the same result to every waiter.
    pub async fn verb(&self, verb: &str, name: &str) -> std::result::Result<(), String> {
        let output = match Command::new(&self.program).arg(verb).arg(name).output().await {
            Ok(output) => output,
            Err(err) => {
                return Err(format!("spawning {} {verb}: {err}", self.program.display()));
            }
        };
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{verb} {name}: {}", stderr.trim()))
        }
    }
}
