mod container;

pub use container::{Container, ContainerRef};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerInfo, Runtime};

/// Name of the symlink selecting the default environment.
pub const DEFAULT_LINK: &str = "_default";

/// Containers with this name prefix compete for the default link; the
/// lexicographically greatest name wins.
const DEFAULT_PREFIX: &str = "fedora-toolbox";

pub struct Config {
    pub envroot: PathBuf,
    pub envfs_path: PathBuf,
    pub run_path: PathBuf,
}

impl Config {
    pub fn mount_path(&self, name: &str) -> PathBuf {
        self.envroot.join(name)
    }
}

/// Owns the container table and converges it, the mount-point directories
/// and the default link toward whatever the runtime reports.
pub struct Supervisor {
    config: Config,
    runtime: Rc<Runtime>,
    containers: RefCell<HashMap<String, ContainerRef>>,
}

impl Supervisor {
    pub fn new(config: Config, runtime: Runtime) -> Rc<Self> {
        Rc::new(Self {
            config,
            runtime: Rc::new(runtime),
            containers: RefCell::new(HashMap::new()),
        })
    }

    /// One full pass: query the runtime, then converge. Collaborator and
    /// per-entry I/O failures are logged; the next trigger retries.
    pub async fn reconcile(&self) -> Result<()> {
        let listing = self.runtime.list().await?;
        self.apply(&listing).await
    }

    /// Converge on a given runtime listing. Only failure to enumerate
    /// ENVROOT aborts the pass.
    pub async fn apply(&self, listing: &[ContainerInfo]) -> Result<()> {
        let eligible: Vec<&ContainerInfo> = listing.iter().filter(|c| c.eligible).collect();

        // classify what is on disk
        let mut old_dirs: Vec<String> = Vec::new();
        let mut old_default: Option<String> = None;
        let mut strays: Vec<PathBuf> = Vec::new();
        let entries = fs::read_dir(&self.config.envroot)
            .with_context(|| format!("listing {}", self.config.envroot.display()))?;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                old_dirs.push(name);
            } else if file_type.is_symlink() && name == DEFAULT_LINK {
                old_default = fs::read_link(entry.path())
                    .ok()
                    .map(|target| target.to_string_lossy().into_owned());
            } else {
                strays.push(entry.path());
            }
        }

        for stray in strays {
            debug!(path = %stray.display(), "removing stray entry");
            if let Err(err) = fs::remove_file(&stray) {
                warn!(path = %stray.display(), ?err, "removing stray entry");
            }
        }

        for info in &eligible {
            // the mount point has to exist before the ENVFS child starts
            if !old_dirs.iter().any(|dir| dir == &info.name) {
                let path = self.config.mount_path(&info.name);
                if let Err(err) = fs::create_dir_all(&path) {
                    warn!(path = %path.display(), ?err, "creating mount dir");
                }
            }
            let existing = self.containers.borrow().get(&info.name).cloned();
            match existing {
                Some(entry) => Container::update(&entry, &self.config, info).await,
                None => {
                    let entry = Container::new(info);
                    self.containers
                        .borrow_mut()
                        .insert(info.name.clone(), entry.clone());
                    if info.pid != 0 {
                        Container::mount(&entry, &self.config);
                    }
                }
            }
        }

        let new_default = eligible
            .iter()
            .filter(|c| c.name.starts_with(DEFAULT_PREFIX))
            .map(|c| c.name.clone())
            .max();

        // drop table entries the runtime no longer reports
        let gone: Vec<String> = self
            .containers
            .borrow()
            .keys()
            .filter(|name| !eligible.iter().any(|c| &c.name == *name))
            .cloned()
            .collect();
        for name in gone {
            let removed = self.containers.borrow_mut().remove(&name);
            if let Some(entry) = removed {
                info!(%name, "container gone");
                Container::unmount(&entry, &self.config).await;
            }
        }

        // and their directories
        for dir in &old_dirs {
            if !eligible.iter().any(|c| &c.name == dir) {
                let path = self.config.mount_path(dir);
                debug!(path = %path.display(), "removing mount dir");
                if let Err(err) = fs::remove_dir(&path) {
                    warn!(path = %path.display(), ?err, "removing mount dir");
                }
            }
        }

        if new_default != old_default {
            let link = self.config.envroot.join(DEFAULT_LINK);
            if old_default.is_some() {
                if let Err(err) = fs::remove_file(&link) {
                    warn!(link = %link.display(), ?err, "removing default link");
                }
            }
            if let Some(target) = &new_default {
                info!(target = %target, "default environment changed");
                if let Err(err) = symlink(target, &link) {
                    warn!(link = %link.display(), ?err, "creating default link");
                }
            }
        }

        Ok(())
    }

    /// Client-requested start. An unknown name is the caller's mistake and
    /// reported synchronously.
    pub async fn start(&self, name: &str) -> std::result::Result<(), String> {
        let entry = self.containers.borrow().get(name).cloned();
        let Some(entry) = entry else {
            return Err(format!("unknown container: {name}"));
        };
        match Container::start(&entry, self.runtime.clone()).await {
            Ok(result) => result,
            Err(_) => Err(format!("start of {name} was interrupted")),
        }
    }

    pub async fn stop(&self, name: &str) -> std::result::Result<(), String> {
        let entry = self.containers.borrow().get(name).cloned();
        let Some(entry) = entry else {
            return Err(format!("unknown container: {name}"));
        };
        match Container::stop(&entry, self.runtime.clone()).await {
            Ok(result) => result,
            Err(_) => Err(format!("stop of {name} was interrupted")),
        }
    }

    /// Unmount every mounted environment; runs once on daemon exit and
    /// waits for each ENVFS child.
    pub async fn shutdown(&self) {
        let entries: Vec<ContainerRef> = self.containers.borrow().values().cloned().collect();
        for entry in entries {
            Container::unmount(&entry, &self.config).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_supervisor(envroot: &Path) -> Rc<Supervisor> {
        Supervisor::new(
            Config {
                envroot: envroot.to_path_buf(),
                envfs_path: PathBuf::from("/bin/true"),
                run_path: PathBuf::from("/bin/true"),
            },
            Runtime::new(PathBuf::from("podman")),
        )
    }

    fn toolbox(name: &str, pid: i32) -> ContainerInfo {
        ContainerInfo {
            id: format!("id-{name}"),
            name: name.into(),
            pid,
            eligible: true,
        }
    }

    fn dir_names(envroot: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(envroot)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn unknown_state_is_cleared() {
        let envroot = tempfile::tempdir().unwrap();
        fs::create_dir(envroot.path().join("a")).unwrap();
        fs::create_dir(envroot.path().join("b")).unwrap();
        symlink("a", envroot.path().join(DEFAULT_LINK)).unwrap();
        fs::write(envroot.path().join("stray.txt"), "junk").unwrap();

        let supervisor = test_supervisor(envroot.path());
        supervisor.apply(&[]).await.unwrap();

        assert!(dir_names(envroot.path()).is_empty());
    }

    #[tokio::test]
    async fn stopped_containers_get_a_directory_and_the_default_link() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());

        supervisor.apply(&[toolbox("fedora-toolbox-40", 0)]).await.unwrap();

        assert!(envroot.path().join("fedora-toolbox-40").is_dir());
        assert_eq!(
            fs::read_link(envroot.path().join(DEFAULT_LINK)).unwrap(),
            PathBuf::from("fedora-toolbox-40")
        );
        let containers = supervisor.containers.borrow();
        assert!(!containers["fedora-toolbox-40"].borrow().mounted());
    }

    #[tokio::test]
    async fn back_to_back_passes_change_nothing() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());
        let listing = vec![
            toolbox("fedora-toolbox-39", 0),
            toolbox("fedora-toolbox-40", 0),
            toolbox("zebra", 0),
        ];

        supervisor.apply(&listing).await.unwrap();
        let before = dir_names(envroot.path());

        supervisor.apply(&listing).await.unwrap();
        assert_eq!(dir_names(envroot.path()), before);
        assert_eq!(
            fs::read_link(envroot.path().join(DEFAULT_LINK)).unwrap(),
            PathBuf::from("fedora-toolbox-40")
        );
        assert_eq!(supervisor.containers.borrow().len(), 3);
    }

    #[tokio::test]
    async fn ineligible_containers_are_ignored() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());
        let mut plain = toolbox("plain", 0);
        plain.eligible = false;

        supervisor
            .apply(&[plain, toolbox("fedora-toolbox-40", 0)])
            .await
            .unwrap();

        assert!(!envroot.path().join("plain").exists());
        assert_eq!(supervisor.containers.borrow().len(), 1);
    }

    #[tokio::test]
    async fn departed_containers_are_removed() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());

        supervisor.apply(&[toolbox("fedora-toolbox-40", 0)]).await.unwrap();
        supervisor.apply(&[]).await.unwrap();

        assert!(dir_names(envroot.path()).is_empty());
        assert!(supervisor.containers.borrow().is_empty());
    }

    #[tokio::test]
    async fn default_link_tracks_the_greatest_toolbox_name() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());

        supervisor.apply(&[toolbox("fedora-toolbox-39", 0)]).await.unwrap();
        assert_eq!(
            fs::read_link(envroot.path().join(DEFAULT_LINK)).unwrap(),
            PathBuf::from("fedora-toolbox-39")
        );

        supervisor
            .apply(&[toolbox("fedora-toolbox-39", 0), toolbox("fedora-toolbox-40", 0)])
            .await
            .unwrap();
        assert_eq!(
            fs::read_link(envroot.path().join(DEFAULT_LINK)).unwrap(),
            PathBuf::from("fedora-toolbox-40")
        );

        // no qualifying name clears the link
        supervisor.apply(&[toolbox("zebra", 0)]).await.unwrap();
        assert!(fs::symlink_metadata(envroot.path().join(DEFAULT_LINK)).is_err());
    }

    #[tokio::test]
    async fn verbs_on_unknown_names_are_user_errors() {
        let envroot = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(envroot.path());

        let err = supervisor.start("nope").await.unwrap_err();
        assert!(err.contains("unknown container"));
        let err = supervisor.stop("nope").await.unwrap_err();
        assert!(err.contains("unknown container"));
    }
}
