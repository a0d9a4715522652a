//! Liveness checks for tracked processes.
//!
//! A pid may be reused by an unrelated process between two polls. The
//! broker accepts that window; it only narrows with a shorter interval.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::ipc::pidfile::is_process_running;

pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// `/proc/<pid>/stat` on Linux, `kill(pid, 0)` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProbe;

impl LivenessProbe for ProcfsProbe {
    fn is_alive(&self, pid: i32) -> bool {
        pid > 0 && is_process_running(pid as u32)
    }
}

/// Probe whose answers are set by hand. Everything is alive until killed.
#[derive(Debug, Default)]
pub struct ManualProbe {
    dead: Mutex<HashSet<i32>>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self, pid: i32) {
        self.dead
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
    }

    pub fn revive(&self, pid: i32) {
        self.dead
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }
}

impl LivenessProbe for ManualProbe {
    fn is_alive(&self, pid: i32) -> bool {
        !self
            .dead
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pid)
    }
}
