use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use toolbox_env::envfs::session::{serve, SessionConfig};

/// Read-only mirror of one container's root filesystem, with an `exe`
/// view that substitutes the run trampoline for executables and a `raw`
/// passthrough view.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// PID of the container's init on the host.
    container_pid: i32,
    /// Where to mount the filesystem.
    mount_path: PathBuf,
    /// Host binary substituted for executables in the exe view.
    run_trampoline_path: PathBuf,
}

fn main() -> ExitCode {
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
    match serve(SessionConfig {
        container_pid: cli.container_pid,
        mountpoint: cli.mount_path,
        trampoline: cli.run_trampoline_path,
    }) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "setup failed");
            ExitCode::FAILURE
        }
    }
}
