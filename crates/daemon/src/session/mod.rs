//! Terminal sessions hosted by the broker.
//!
//! A session owns one subprocess (or one attached pty master), the two
//! bounded queues between that process and its emulator, the pump threads
//! moving bytes through them, and an exit watcher. Shell sessions restart
//! their process whenever it exits; log and logcat sessions finish for good.

pub mod emulator;
mod pump;
pub mod terminal;

use std::fmt;
use std::path::PathBuf;

use protocol::SessionKindTag;
use thiserror::Error;

pub use emulator::{scrollback_factory, EmulatorFactory, ScrollbackEmulator, TerminalEmulator};
pub use terminal::{LogSource, SessionContext, TerminalSession};

/// Broker-assigned session identifier. Never reused while the broker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tracked process entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackedId(pub u64);

impl fmt::Display for TrackedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Interactive shell, restarted whenever it exits.
    Shell,
    /// Read-only view of a pty master owned by someone else.
    Log,
    /// `logcat` filtered to one pid.
    Logcat,
}

impl SessionKind {
    pub fn tag(self) -> SessionKindTag {
        match self {
            SessionKind::Shell => SessionKindTag::Shell,
            SessionKind::Log => SessionKindTag::Log,
            SessionKind::Logcat => SessionKindTag::Logcat,
        }
    }
}

/// Who a session was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOrigin {
    Local,
    Tracked {
        tracked_id: TrackedId,
        identity: String,
        pid: i32,
    },
}

impl SessionOrigin {
    pub fn tracked_id(&self) -> Option<TrackedId> {
        match self {
            SessionOrigin::Tracked { tracked_id, .. } => Some(*tracked_id),
            SessionOrigin::Local => None,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            SessionOrigin::Tracked { identity, .. } => Some(identity),
            SessionOrigin::Local => None,
        }
    }
}

/// Program a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `<program> -C --pid=<pid>`
    pub fn logcat(program: impl Into<String>, pid: i32) -> Self {
        Self::new(program).arg("-C").arg(format!("--pid={}", pid))
    }
}

/// Notifications posted by session threads to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// New bytes are waiting in the output queue.
    OutputAvailable(SessionId),
    Resized { id: SessionId, cols: u16, rows: u16 },
    /// The session ended and will not produce more output.
    Finished { id: SessionId, exit_status: i32 },
}

/// Channel session threads post their events to.
pub type SessionEvents = tokio::sync::mpsc::UnboundedSender<SessionEvent>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("failed to resize pty: {0}")]
    ResizeFailed(String),

    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("session {0} has finished")]
    Finished(SessionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit status recorded when `waitpid` could not tell how a process ended.
pub const EXIT_STATUS_UNKNOWN: i32 = -1000;

/// Banner written into the output stream when a process ends.
pub fn exit_banner(exit_status: i32) -> String {
    if exit_status == EXIT_STATUS_UNKNOWN {
        "\r\n[Process completed (status unknown)]\r\n".to_string()
    } else if exit_status < 0 {
        format!("\r\n[Process completed (signal {})]\r\n", -exit_status)
    } else {
        format!("\r\n[Process completed (code {})]\r\n", exit_status)
    }
}

/// Written after the exit banner when a shell is respawned.
pub const RESTART_BANNER: &str = "[Restarting]\r\n";

/// Display name for a session.
pub fn session_name(kind: SessionKind, origin: &SessionOrigin, pid: u32) -> String {
    match (kind, origin) {
        (SessionKind::Shell, _) => format!("SHELL [LOCAL: pid={}]", pid),
        (SessionKind::Log, SessionOrigin::Local) => format!("LOG [LOCAL: pid={}]", pid),
        (SessionKind::Log, SessionOrigin::Tracked { identity, pid, .. }) => {
            format!("LOG [CONNECTED: pid={}, {}]", pid, identity)
        }
        (SessionKind::Logcat, SessionOrigin::Local) => format!(
            "logcat -C --pid={} [LOCAL: pid={}]",
            std::process::id(),
            pid
        ),
        (SessionKind::Logcat, SessionOrigin::Tracked { identity, pid, .. }) => {
            format!("logcat -C --pid={} [CONNECTED: {}]", pid, identity)
        }
    }
}

/// Shell to run when none is configured: `$SHELL`, then `/bin/sh`.
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked() -> SessionOrigin {
        SessionOrigin::Tracked {
            tracked_id: TrackedId(1),
            identity: "com.example.app".to_string(),
            pid: 4321,
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(
            session_name(SessionKind::Shell, &SessionOrigin::Local, 77),
            "SHELL [LOCAL: pid=77]"
        );
        assert_eq!(
            session_name(SessionKind::Log, &SessionOrigin::Local, 12),
            "LOG [LOCAL: pid=12]"
        );
        assert_eq!(
            session_name(SessionKind::Log, &tracked(), 4321),
            "LOG [CONNECTED: pid=4321, com.example.app]"
        );
        assert_eq!(
            session_name(SessionKind::Logcat, &tracked(), 900),
            "logcat -C --pid=4321 [CONNECTED: com.example.app]"
        );
        assert_eq!(
            session_name(SessionKind::Logcat, &SessionOrigin::Local, 900),
            format!("logcat -C --pid={} [LOCAL: pid=900]", std::process::id())
        );
    }

    #[test]
    fn test_exit_banner() {
        assert_eq!(exit_banner(7), "\r\n[Process completed (code 7)]\r\n");
        assert_eq!(exit_banner(-9), "\r\n[Process completed (signal 9)]\r\n");
        assert_eq!(exit_banner(0), "\r\n[Process completed (code 0)]\r\n");
        assert_eq!(
            exit_banner(EXIT_STATUS_UNKNOWN),
            "\r\n[Process completed (status unknown)]\r\n"
        );
    }

    #[test]
    fn test_logcat_command() {
        let command = CommandSpec::logcat("logcat", 4321);
        assert_eq!(command.program, "logcat");
        assert_eq!(command.args, vec!["-C".to_string(), "--pid=4321".to_string()]);
    }

    #[test]
    fn test_detect_shell() {
        assert_eq!(detect_shell(Some("/bin/bash".into())), "/bin/bash");
        assert!(!detect_shell(None).is_empty());
    }

    #[test]
    fn test_origin_accessors() {
        assert_eq!(tracked().tracked_id(), Some(TrackedId(1)));
        assert_eq!(tracked().identity(), Some("com.example.app"));
        assert_eq!(SessionOrigin::Local.tracked_id(), None);
    }
}
