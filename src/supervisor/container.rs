use std::cell::RefCell;
use std::rc::Rc;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::mounts;
use crate::runtime::{ContainerInfo, Runtime};

use super::Config;

type Waiter = oneshot::Sender<Result<(), String>>;

/// Supervised state for one eligible container: identity, the init PID the
/// runtime last reported, the ENVFS child serving its mount, and waiters
/// for in-flight start/stop requests.
pub struct Container {
    pub id: String,
    pub name: String,
    pub pid: i32,
    fuse_child: Option<Child>,
    pending_starts: Vec<Waiter>,
    pending_stops: Vec<Waiter>,
}

pub type ContainerRef = Rc<RefCell<Container>>;

impl Container {
    pub fn new(info: &ContainerInfo) -> ContainerRef {
        Rc::new(RefCell::new(Self {
            id: info.id.clone(),
            name: info.name.clone(),
            pid: info.pid,
            fuse_child: None,
            pending_starts: Vec::new(),
            pending_stops: Vec::new(),
        }))
    }

    pub fn mounted(&self) -> bool {
        self.fuse_child.is_some()
    }

    /// Spawn the ENVFS helper for a running container. Spawn failures are
    /// logged; the next reconciliation retries.
    pub fn mount(this: &ContainerRef, config: &Config) {
        let mut container = this.borrow_mut();
        if container.fuse_child.is_some() || container.pid == 0 {
            return;
        }
        let mount_path = config.mount_path(&container.name);
        let spawned = Command::new(&config.envfs_path)
            .arg(container.pid.to_string())
            .arg(&mount_path)
            .arg(&config.run_path)
            .spawn();
        match spawned {
            Ok(child) => {
                info!(name = %container.name, pid = container.pid, "environment mounted");
                container.fuse_child = Some(child);
            }
            Err(err) => {
                warn!(name = %container.name, ?err, "spawning envfs failed");
            }
        }
    }

    /// Unmount and reap the ENVFS child, if any.
    pub async fn unmount(this: &ContainerRef, config: &Config) {
        let (name, child) = {
            let mut container = this.borrow_mut();
            (container.name.clone(), container.fuse_child.take())
        };
        let Some(mut child) = child else {
            return;
        };
        let mount_path = config.mount_path(&name);
        if let Err(err) = mounts::unmount(&mount_path).await {
            warn!(name = %name, ?err, "unmount failed");
        }
        match child.wait().await {
            Ok(status) => debug!(name = %name, %status, "envfs exited"),
            Err(err) => warn!(name = %name, ?err, "waiting for envfs"),
        }
    }

    /// Fold a fresh runtime snapshot into the entry. A PID change always
    /// unmounts first: even when both PIDs are nonzero, the old instance
    /// is gone and its mount with it.
    pub async fn update(this: &ContainerRef, config: &Config, info: &ContainerInfo) {
        {
            let mut container = this.borrow_mut();
            if container.id != info.id {
                info!(
                    name = %container.name,
                    old = %container.id,
                    new = %info.id,
                    "container replaced"
                );
                container.id = info.id.clone();
            }
        }
        let old_pid = this.borrow().pid;
        if old_pid == info.pid {
            return;
        }
        if old_pid != 0 {
            Self::unmount(this, config).await;
        }
        this.borrow_mut().pid = info.pid;
        if info.pid != 0 {
            Self::mount(this, config);
        }
    }

    /// Request a container start. Concurrent requests coalesce onto one
    /// runtime subprocess; every waiter receives its result.
    pub fn start(this: &ContainerRef, runtime: Rc<Runtime>) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        let spawn_driver = {
            let mut container = this.borrow_mut();
            if container.pid != 0 {
                let _ = tx.send(Ok(()));
                return rx;
            }
            container.pending_starts.push(tx);
            container.pending_starts.len() == 1
        };
        if spawn_driver {
            let this = this.clone();
            tokio::task::spawn_local(async move {
                let name = this.borrow().name.clone();
                let result = runtime.verb("start", &name).await;
                let waiters = std::mem::take(&mut this.borrow_mut().pending_starts);
                debug!(name = %name, waiters = waiters.len(), ok = result.is_ok(), "start settled");
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }
        rx
    }

    /// Request a container stop; same coalescing as start.
    pub fn stop(this: &ContainerRef, runtime: Rc<Runtime>) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        let spawn_driver = {
            let mut container = this.borrow_mut();
            if container.pid == 0 {
                let _ = tx.send(Ok(()));
                return rx;
            }
            container.pending_stops.push(tx);
            container.pending_stops.len() == 1
        };
        if spawn_driver {
            let this = this.clone();
            tokio::task::spawn_local(async move {
                let name = this.borrow().name.clone();
                let result = runtime.verb("stop", &name).await;
                let waiters = std::mem::take(&mut this.borrow_mut().pending_stops);
                debug!(name = %name, waiters = waiters.len(), ok = result.is_ok(), "stop settled");
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }
        rx
    }
}
