use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const PRODUCT_NAME: &str = "toolbox";

const LICENSE_MARKER: &str = "COPYING";

/// Where to look for the sibling helper binaries (`envfs`, `run`).
#[derive(Debug, Clone)]
pub struct HelperDirs {
    primary: PathBuf,
    fallback: Option<PathBuf>,
}

impl HelperDirs {
    /// Primary lookup dir is argv[0]'s directory; the fallback is the
    /// nearest enclosing source checkout, recognized as an ancestor named
    /// after the product that carries the license file.
    pub fn from_argv0() -> Self {
        let argv0 = env::args_os().next().map(PathBuf::from).unwrap_or_default();
        let primary = argv0
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self::new(primary)
    }

    pub fn new(primary: PathBuf) -> Self {
        let fallback = primary
            .ancestors()
            .find(|dir| {
                dir.file_name().is_some_and(|name| name == PRODUCT_NAME)
                    && dir.join(LICENSE_MARKER).is_file()
            })
            .map(Path::to_path_buf);
        Self { primary, fallback }
    }

    /// `primary/name` if executable, else `fallback/name` if executable.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let mut candidates = vec![self.primary.join(name)];
        if let Some(fallback) = &self.fallback {
            candidates.push(fallback.join(name));
        }
        for candidate in candidates {
            if is_executable(&candidate) {
                debug!(helper = name, path = %candidate.display(), "resolved helper");
                return Some(candidate);
            }
        }
        None
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The root under which per-container mount points and the `_default`
/// symlink live.
pub fn envroot() -> PathBuf {
    data_home().join(PRODUCT_NAME).join("env")
}

fn data_home() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local/share")
}

fn runtime_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR").filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    PathBuf::from(format!("/run/user/{}", nix::unistd::getuid()))
}

/// Directory whose changes signal container runtime activity.
pub fn default_watch_dir() -> PathBuf {
    runtime_dir().join("libpod/tmp/socket")
}

pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("toolbox-envd.sock")
}
