use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use toolbox_env::ipc::{Request, Response};
use toolbox_env::mounts;
use toolbox_env::paths::{self, HelperDirs};
use toolbox_env::runtime::Runtime;
use toolbox_env::supervisor::{Config, Supervisor};

/// Per-user supervisor exposing container environments under
/// $XDG_DATA_HOME/toolbox/env.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// IPC socket address.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Directory watched for container runtime activity.
    #[arg(long)]
    watch_dir: Option<PathBuf>,
    /// Container runtime program.
    #[arg(long, default_value = "podman")]
    podman: PathBuf,
}

fn main() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        Level::TRACE
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(level)
        .init();

    let cli = Cli::parse();

    // everything shares the one thread; container state is never sent
    // across threads
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let envroot = paths::envroot();
    std::fs::create_dir_all(&envroot)
        .with_context(|| format!("creating {}", envroot.display()))?;

    let helpers = HelperDirs::from_argv0();
    let envfs_path = helpers.resolve("envfs").context("cannot find the envfs helper")?;
    let run_path = helpers.resolve("run").context("cannot find the run helper")?;

    info!(envroot = %envroot.display(), "starting");
    mounts::sweep_stale(&envroot).await?;

    let supervisor = Supervisor::new(
        Config {
            envroot,
            envfs_path,
            run_path,
        },
        Runtime::new(cli.podman),
    );

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
    let watch_dir = cli.watch_dir.unwrap_or_else(paths::default_watch_dir);
    spawn_watch_thread(watch_dir, trigger_tx);

    let socket_path = cli.socket.unwrap_or_else(paths::default_socket_path);
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "listening");

    // pick up whatever is already running
    if let Err(err) = supervisor.reconcile().await {
        warn!(?err, "reconciliation failed");
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = trigger_rx.recv() => {
                if let Err(err) = supervisor.reconcile().await {
                    warn!(?err, "reconciliation failed");
                }
                // triggers that piled up during the pass are stale now;
                // the next runtime change fires a fresh one
                while trigger_rx.try_recv().is_ok() {}
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let supervisor = Rc::clone(&supervisor);
                        tokio::task::spawn_local(async move {
                            if let Err(err) = handle_client(supervisor, stream).await {
                                debug!(?err, "client connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(?err, "accept failed"),
                }
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("shutting down");
    supervisor.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_client(supervisor: Rc<Supervisor>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Start { name }) => match supervisor.start(&name).await {
                Ok(()) => Response::ok(),
                Err(err) => Response::err(err),
            },
            Ok(Request::Stop { name }) => match supervisor.stop(&name).await {
                Ok(()) => Response::ok(),
                Err(err) => Response::err(err),
            },
            Err(err) => Response::err(format!("bad request: {err}")),
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
    Ok(())
}

/// Blocking inotify watch on the runtime's socket directory; every change
/// nudges the reconciliation loop. Retries until the directory exists.
fn spawn_watch_thread(dir: PathBuf, trigger: mpsc::Sender<()>) {
    std::thread::Builder::new()
        .name("runtime-watch".into())
        .spawn(move || watch_loop(&dir, trigger))
        .expect("spawning watch thread");
}

fn watch_loop(dir: &Path, trigger: mpsc::Sender<()>) {
    let changes = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_ATTRIB;
    loop {
        let inotify = match Inotify::init(InitFlags::IN_CLOEXEC) {
            Ok(inotify) => inotify,
            Err(err) => {
                error!(?err, "inotify init failed");
                return;
            }
        };
        if let Err(err) = inotify.add_watch(dir, changes) {
            debug!(dir = %dir.display(), ?err, "waiting for watch directory");
            std::thread::sleep(Duration::from_secs(5));
            continue;
        }
        // the directory may have changed while the watch was being set up
        let _ = trigger.try_send(());
        loop {
            match inotify.read_events() {
                Ok(events) => {
                    if events
                        .iter()
                        .any(|event| event.mask.contains(AddWatchFlags::IN_IGNORED))
                    {
                        // watched directory went away; wait for it anew
                        break;
                    }
                    let _ = trigger.try_send(());
                }
                Err(err) => {
                    warn!(?err, "inotify read failed");
                    break;
                }
            }
        }
    }
}
