use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::{FuseChannel, FuseSession};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use tracing::{debug, error, info, warn};

use super::fs::EnvFs;

/// Kernel request dispatch threads per mount.
const WORKER_THREADS: usize = 4;

const FS_NAME: &str = "envfs";

pub struct SessionConfig {
    pub container_pid: i32,
    pub mountpoint: PathBuf,
    pub trampoline: PathBuf,
}

/// Mount and serve one per-container session. Returns once the filesystem
/// has been unmounted, by signal or by the supervisor; any setup failure
/// is fatal and leaves the mount torn down.
pub fn serve(config: SessionConfig) -> Result<()> {
    // the source fd must be captured before entering the user namespace;
    // the open would fail under the mapped credentials
    let source = open_source_root(config.container_pid)?;
    let fs = Arc::new(EnvFs::new(source, config.trampoline));

    let mut session = FuseSession::new(&config.mountpoint, FS_NAME, "", true)
        .map_err(|err| anyhow!("creating fuse session: {err}"))?;
    session
        .mount()
        .map_err(|err| anyhow!("mounting {}: {err}", config.mountpoint.display()))?;
    info!(
        mountpoint = %config.mountpoint.display(),
        pid = config.container_pid,
        "mounted"
    );

    if let Err(err) = enter_user_namespace(config.container_pid) {
        error!(?err, "cannot enter container user namespace");
        let _ = session.umount();
        return Err(err);
    }

    let (exit_tx, exit_rx) = mpsc::channel::<()>();
    {
        let exit_tx = exit_tx.clone();
        ctrlc::set_handler(move || {
            let _ = exit_tx.send(());
        })
        .context("installing signal handler")?;
    }

    let mut workers = Vec::with_capacity(WORKER_THREADS);
    for i in 0..WORKER_THREADS {
        let channel = session
            .new_channel()
            .map_err(|err| anyhow!("creating fuse channel: {err}"))?;
        let fs = fs.clone();
        let exit_tx = exit_tx.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("envfs{i}"))
                .spawn(move || {
                    serve_channel(fs, channel);
                    // a dead channel means the kernel is done with us
                    let _ = exit_tx.send(());
                })
                .context("spawning worker thread")?,
        );
    }

    // first of: signal, external unmount observed by a worker
    let _ = exit_rx.recv();
    debug!("tearing down session");
    let _ = session.wake();
    if let Err(err) = session.umount() {
        debug!(?err, "umount");
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn serve_channel(fs: Arc<EnvFs>, mut channel: FuseChannel) {
    let server = Server::new(fs);
    loop {
        match channel.get_request() {
            Ok(Some((reader, writer))) => {
                if let Err(err) = server.handle_message(reader, writer.into(), None, None) {
                    match err {
                        fuse_backend_rs::Error::EncodeMessage(ref io_err)
                            if is_channel_closed(io_err) =>
                        {
                            break;
                        }
                        _ => warn!(?err, "request failed"),
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                if !is_transport_closed(&err) {
                    error!(?err, "fuse channel error");
                }
                break;
            }
        }
    }
}

fn is_channel_closed(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENODEV))
}

fn is_transport_closed(err: &fuse_backend_rs::transport::Error) -> bool {
    match err {
        fuse_backend_rs::transport::Error::IoError(io_err) => is_channel_closed(io_err),
        _ => false,
    }
}

fn open_source_root(pid: i32) -> Result<OwnedFd> {
    let path = format!("/proc/{pid}/root");
    let fd = open(
        path.as_str(),
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("opening {path}"))?;
    Ok(fd)
}

fn enter_user_namespace(pid: i32) -> Result<()> {
    let path = format!("/proc/{pid}/ns/user");
    let ns = File::open(&path).with_context(|| format!("opening {path}"))?;
    setns(ns, CloneFlags::CLONE_NEWUSER).context("setns")?;
    Ok(())
}
