//! PID file handling for the broker daemon.
//!
//! The PID file is `daemon.pid` inside `daemon.data_dir`, which defaults to
//! `$XDG_DATA_HOME/termbroker` (`~/.local/share/termbroker`).
//!
//! Stale files (unparsable, or naming a dead process) are removed whenever
//! they are read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// PID file inside the daemon's data directory.
pub fn get_pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.pid")
}

/// PID of the daemon recorded in `data_dir`, if it is still running.
pub fn get_daemon_pid(data_dir: &Path) -> Option<u32> {
    read_pid_file(&get_pid_file_path(data_dir))
}

/// Read the PID recorded at `path` if that process is still alive.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let pid: u32 = match contents.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Record the current process id at `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the PID file at `path` if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID is running.
///
/// On Linux this checks `/proc/{pid}/stat`; elsewhere it probes with
/// `kill(pid, 0)`.
pub(crate) fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
            _ => false,
        }
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
