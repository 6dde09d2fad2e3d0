// ── dere engine: On-Disk Layout ────────────────────────────────────────────
// Everything the daemon writes lives under one data directory:
//   dere.db              primary relational store
//   daemon.pid           running daemon's pid
//   daemon.sock          UDS JSON-RPC socket
//   hook_env_<pid>.json  discovery file for lifecycle hooks
//
// Stale pid/socket files from a crashed daemon are recognized by probing
// the recorded pid and unlinked before bind.

use crate::atoms::error::{DaemonError, DaemonResult};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Root data directory: `$XDG_DATA_HOME/dere` (or the platform equivalent),
/// overridable by placing `DERE_DB_PATH` elsewhere.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dere")
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("dere.db")
}

pub fn pid_file() -> PathBuf {
    data_dir().join("daemon.pid")
}

pub fn socket_file() -> PathBuf {
    data_dir().join("daemon.sock")
}

pub fn hook_env_file(pid: u32) -> PathBuf {
    data_dir().join(format!("hook_env_{pid}.json"))
}

/// Ensure the data directory exists.
pub fn ensure_data_dir() -> DaemonResult<()> {
    std::fs::create_dir_all(data_dir())?;
    Ok(())
}

/// Whether a process with the given pid appears to be alive.
/// Linux-only probe via /proc; elsewhere a missing probe means "assume dead"
/// so stale files never wedge startup.
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Remove pid/socket files left behind by a crashed daemon. Refuses to
/// start when another live daemon holds the pid file.
pub fn cleanup_stale_files() -> DaemonResult<()> {
    let pid_path = pid_file();
    if let Ok(contents) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            if pid != std::process::id() && pid_alive(pid) {
                return Err(DaemonError::Terminal(format!(
                    "another daemon is already running (pid {pid})"
                )));
            }
            warn!("[paths] Removing stale pid file for dead pid {pid}");
        }
        std::fs::remove_file(&pid_path).ok();
    }
    let sock = socket_file();
    if sock.exists() {
        std::fs::remove_file(&sock).ok();
    }
    // Hook env files from dead daemons
    if let Ok(entries) = std::fs::read_dir(data_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(pid) = name
                .strip_prefix("hook_env_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u32>().ok())
            {
                if !pid_alive(pid) {
                    std::fs::remove_file(entry.path()).ok();
                }
            }
        }
    }
    Ok(())
}

/// Write this daemon's pid file and hook discovery file.
pub fn write_runtime_files(http_addr: &str, db_path: &Path) -> DaemonResult<()> {
    let pid = std::process::id();
    std::fs::write(pid_file(), pid.to_string())?;

    let env = serde_json::json!({
        "pid": pid,
        "socket_path": socket_file(),
        "http_addr": http_addr,
        "db_path": db_path,
    });
    std::fs::write(hook_env_file(pid), serde_json::to_vec_pretty(&env)?)?;
    info!("[paths] Runtime files written under {:?}", data_dir());
    Ok(())
}

/// Remove this daemon's runtime files on clean shutdown.
pub fn remove_runtime_files() {
    let pid = std::process::id();
    std::fs::remove_file(pid_file()).ok();
    std::fs::remove_file(socket_file()).ok();
    std::fs::remove_file(hook_env_file(pid)).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_env_filename_embeds_pid() {
        let path = hook_env_file(4242);
        assert!(path.to_string_lossy().ends_with("hook_env_4242.json"));
    }

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
