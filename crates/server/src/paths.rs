//! Central path resolution for all fleetdock data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `FLEETDOCK_DATA_DIR` env > `~/.fleetdock`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `FLEETDOCK_DATA_DIR` env > `~/.fleetdock` default.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("FLEETDOCK_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?
            .join(".fleetdock")
    };

    *DATA_DIR.write().unwrap_or_else(|e| e.into_inner()) = Some(dir.clone());
    Ok(dir)
}

/// Return the current data directory, falling back to `~/.fleetdock` when
/// `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR.read().unwrap_or_else(|e| e.into_inner()).clone() {
        return dir;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".fleetdock")
}

pub fn db_path() -> PathBuf {
    data_dir().join("fleetdock.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn socket_path() -> PathBuf {
    data_dir().join("control.sock")
}

/// Log of agent turn completions, appended by tmux bell hooks and agent
/// lifecycle hooks as `<epoch>\t<session>` lines and emptied once drained.
pub fn completion_log_path() -> PathBuf {
    data_dir().join("completions.log")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("fleetdock.pid")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
