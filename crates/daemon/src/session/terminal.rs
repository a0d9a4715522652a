//! A single hosted terminal session.
//!
//! Lifecycle: `Created -> Running -> Exited`. Nothing is spawned until the
//! first [`TerminalSession::update_size`], because the pty needs a size.
//! Each spawned process gets a fresh input queue plus a reader pump, a
//! writer pump and a waiter thread. The output queue lives as long as the
//! session so a restarted shell keeps appending to the same stream.

use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use protocol::SessionSummary;

use super::emulator::{EmulatorFactory, TerminalEmulator};
use super::pump::{spawn_writer, ReaderPump};
use super::{
    exit_banner, session_name, CommandSpec, SessionError, SessionEvent, SessionEvents, SessionId,
    SessionKind, SessionOrigin, EXIT_STATUS_UNKNOWN, RESTART_BANNER,
};
use crate::byte_queue::{ByteQueue, SESSION_QUEUE_CAPACITY};
use crate::pty::PtyPair;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared plumbing every session of one owner is built with.
#[derive(Clone)]
pub struct SessionContext {
    pub events: SessionEvents,
    pub emulator_factory: EmulatorFactory,
    pub queue_capacity: usize,
}

impl SessionContext {
    pub fn new(events: SessionEvents, emulator_factory: EmulatorFactory) -> Self {
        Self {
            events,
            emulator_factory,
            queue_capacity: SESSION_QUEUE_CAPACITY,
        }
    }
}

/// Where a log session reads from.
#[derive(Debug)]
pub enum LogSource {
    /// A fresh pair owned by the session; its slave is exposed for writing.
    NewPair,
    /// Master side of somebody else's pty.
    Master(OwnedFd),
}

enum Master {
    Spawned(Box<dyn MasterPty + Send>),
    Attached(OwnedFd),
}

impl Master {
    fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        match self {
            Master::Attached(fd) => fd.try_clone(),
            Master::Spawned(master) => {
                let raw = master
                    .as_raw_fd()
                    .ok_or_else(|| io::Error::other("pty master has no descriptor"))?;
                // SAFETY: `raw` is owned by `master`, which outlives this borrow.
                let fd = unsafe { BorrowedFd::borrow_raw(raw) };
                fd.try_clone_to_owned()
            }
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self {
            Master::Spawned(master) => master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::ResizeFailed(e.to_string())),
            // Window size of an attached pty belongs to its owner.
            Master::Attached(_) => Ok(()),
        }
    }
}

/// Per-process plumbing, torn down by `cleanup_resources`.
struct ProcessIo {
    master: Master,
    input: Option<Arc<ByteQueue>>,
    reader: Option<ReaderPump>,
    writer: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
}

struct Inner {
    id: SessionId,
    kind: SessionKind,
    origin: SessionOrigin,
    command: Option<CommandSpec>,
    log_source: Mutex<Option<LogSource>>,
    log_slave: Mutex<Option<OwnedFd>>,
    welcome: bool,
    ctx: SessionContext,

    emulator: Mutex<Option<Box<dyn TerminalEmulator>>>,
    output: Arc<ByteQueue>,
    io: Mutex<Option<ProcessIo>>,
    size: Mutex<Option<(u16, u16)>>,

    pid: AtomicU32,
    running: AtomicBool,
    exit_status: AtomicI32,
    stopping: AtomicBool,

    phase: Mutex<Phase>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

/// Cheap, cloneable handle on a session.
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TerminalSession {
    #[allow(clippy::too_many_arguments)]
    fn build(
        id: SessionId,
        kind: SessionKind,
        origin: SessionOrigin,
        command: Option<CommandSpec>,
        log_source: Option<LogSource>,
        pid: u32,
        welcome: bool,
        ctx: SessionContext,
    ) -> Self {
        let output = Arc::new(ByteQueue::new(ctx.queue_capacity));
        Self {
            inner: Arc::new(Inner {
                id,
                kind,
                origin,
                command,
                log_source: Mutex::new(log_source),
                log_slave: Mutex::new(None),
                welcome,
                ctx,
                emulator: Mutex::new(None),
                output,
                io: Mutex::new(None),
                size: Mutex::new(None),
                pid: AtomicU32::new(pid),
                running: AtomicBool::new(false),
                exit_status: AtomicI32::new(0),
                stopping: AtomicBool::new(false),
                phase: Mutex::new(Phase::Created),
                supervisor: Mutex::new(None),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// A shell session. Its process is restarted every time it exits.
    pub fn shell(id: SessionId, command: CommandSpec, ctx: SessionContext) -> Self {
        Self::build(
            id,
            SessionKind::Shell,
            SessionOrigin::Local,
            Some(command),
            None,
            0,
            false,
            ctx,
        )
    }

    /// A logcat session running `command` once.
    pub fn logcat(
        id: SessionId,
        origin: SessionOrigin,
        command: CommandSpec,
        ctx: SessionContext,
    ) -> Self {
        Self::build(
            id,
            SessionKind::Logcat,
            origin,
            Some(command),
            None,
            0,
            false,
            ctx,
        )
    }

    /// A log session showing the output of process `pid`.
    pub fn log(
        id: SessionId,
        origin: SessionOrigin,
        source: LogSource,
        pid: u32,
        welcome: bool,
        ctx: SessionContext,
    ) -> Self {
        Self::build(
            id,
            SessionKind::Log,
            origin,
            None,
            Some(source),
            pid,
            welcome,
            ctx,
        )
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    pub fn origin(&self) -> &SessionOrigin {
        &self.inner.origin
    }

    /// 0 before the first spawn.
    pub fn pid(&self) -> u32 {
        self.inner.pid.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Meaningful only while `is_running()` is false: 0 when never run,
    /// N for exit code N, -S for signal S.
    pub fn exit_status(&self) -> i32 {
        self.inner.exit_status.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> String {
        session_name(self.inner.kind, &self.inner.origin, self.pid())
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        *lock(&self.inner.size)
    }

    /// True once the session produced its last byte of output.
    pub fn is_finished(&self) -> bool {
        *lock(&self.inner.done)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.inner.id.0,
            kind: self.inner.kind.tag(),
            name: self.name(),
            pid: self.pid(),
            running: self.is_running(),
            exit_status: self.exit_status(),
            tracked_identity: self.inner.origin.identity().map(str::to_string),
        }
    }

    /// Set the terminal size. The first call creates the emulator and
    /// starts the session; later calls resize the pty and the emulator.
    pub fn update_size(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }

        let first = {
            let mut size = lock(&self.inner.size);
            let first = size.is_none();
            *size = Some((cols, rows));
            first
        };

        if first {
            *lock(&self.inner.emulator) = Some((self.inner.ctx.emulator_factory)(cols, rows));
            return self.start(cols, rows);
        }

        if let Some(emulator) = lock(&self.inner.emulator).as_mut() {
            emulator.resize(cols, rows);
        }
        if let Some(io) = lock(&self.inner.io).as_ref() {
            io.master.resize(cols, rows)?;
        }
        let _ = self.inner.ctx.events.send(SessionEvent::Resized {
            id: self.inner.id,
            cols,
            rows,
        });
        tracing::debug!(session_id = %self.inner.id, cols, rows, "resized session");
        Ok(())
    }

    fn start(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let mut phase = lock(&self.inner.phase);
        if *phase != Phase::Created || self.inner.stopping.load(Ordering::SeqCst) {
            return Err(SessionError::Finished(self.inner.id));
        }
        *phase = Phase::Started;

        let result = match self.inner.kind {
            SessionKind::Log => self.start_log(cols, rows),
            SessionKind::Shell | SessionKind::Logcat => self.start_process(cols, rows),
        };
        if let Err(e) = &result {
            tracing::warn!(session_id = %self.inner.id, error = %e, "session failed to start");
            self.finalize(self.exit_status(), false);
        }
        result
    }

    fn start_log(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let source = lock(&self.inner.log_source)
            .take()
            .unwrap_or(LogSource::NewPair);
        let master = match source {
            LogSource::Master(fd) => fd,
            LogSource::NewPair => {
                let (master, slave) = PtyPair::open(cols, rows)?.into_fds();
                *lock(&self.inner.log_slave) = Some(slave);
                master
            }
        };

        self.attach_io(Master::Attached(master), self.pid(), false)?;
        if self.inner.welcome {
            let banner = format!("{}\r\n", self.name());
            if self.inner.output.write(banner.as_bytes()).is_ok() {
                self.notify_output();
            }
        }
        tracing::info!(session_id = %self.inner.id, name = %self.name(), "log session attached");
        Ok(())
    }

    fn start_process(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let pid = self.spawn_process(cols, rows)?;
        let session = self.clone();
        let handle = thread::Builder::new()
            .name(format!("TermSessionWaiter[pid={}]", pid))
            .spawn(move || session.supervise(pid));
        match handle {
            Ok(handle) => {
                *lock(&self.inner.supervisor) = Some(handle);
                Ok(())
            }
            Err(e) => {
                kill_pid(pid);
                let status = wait_for_exit(pid);
                self.cleanup_resources(status);
                Err(SessionError::Io(e))
            }
        }
    }

    fn spawn_process(&self, cols: u16, rows: u16) -> Result<u32, SessionError> {
        let command = self
            .inner
            .command
            .as_ref()
            .ok_or_else(|| SessionError::SpawnFailed("no command configured".into()))?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let pid = child
            .process_id()
            .ok_or_else(|| SessionError::SpawnFailed("spawned process has no pid".into()))?;
        // Reaped through waitpid by the waiter thread.
        drop(child);
        drop(pair.slave);

        if let Err(e) = self.attach_io(Master::Spawned(pair.master), pid, true) {
            kill_pid(pid);
            wait_for_exit(pid);
            return Err(e);
        }

        tracing::info!(
            session_id = %self.inner.id,
            pid = pid,
            program = %command.program,
            "spawned session process"
        );
        Ok(pid)
    }

    fn notify_output(&self) {
        let _ = self
            .inner
            .ctx
            .events
            .send(SessionEvent::OutputAvailable(self.inner.id));
    }

    fn attach_io(&self, master: Master, pid: u32, with_writer: bool) -> Result<(), SessionError> {
        let reader_fd = master.try_clone_fd()?;
        let writer_fd = if with_writer {
            Some(master.try_clone_fd()?)
        } else {
            None
        };

        let events = self.inner.ctx.events.clone();
        let id = self.inner.id;
        let reader = ReaderPump::spawn(
            format!("TermSessionInputReader[pid={}]", pid),
            reader_fd,
            Arc::clone(&self.inner.output),
            move || {
                let _ = events.send(SessionEvent::OutputAvailable(id));
            },
        )?;

        let (input, writer) = match writer_fd {
            Some(fd) => {
                let queue = Arc::new(ByteQueue::new(self.inner.ctx.queue_capacity));
                match spawn_writer(
                    format!("TermSessionOutputWriter[pid={}]", pid),
                    fd,
                    Arc::clone(&queue),
                ) {
                    Ok(handle) => (Some(queue), Some(handle)),
                    Err(e) => {
                        reader.finish();
                        return Err(SessionError::Io(e));
                    }
                }
            }
            None => (None, None),
        };

        *lock(&self.inner.io) = Some(ProcessIo {
            master,
            input,
            reader: Some(reader),
            writer,
        });
        self.inner.pid.store(pid, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Waiter loop: wait for the process, clean up, and respawn shells.
    fn supervise(self, mut pid: u32) {
        loop {
            if self.inner.stopping.load(Ordering::SeqCst) {
                kill_pid(pid);
            }

            let status = wait_for_exit(pid);
            tracing::info!(
                session_id = %self.inner.id,
                pid = pid,
                exit_status = status,
                "session process exited"
            );
            self.cleanup_resources(status);

            let restart = self.inner.kind == SessionKind::Shell
                && !self.inner.stopping.load(Ordering::SeqCst);
            if !restart {
                self.finalize(status, true);
                return;
            }

            if self.inner.output.write(RESTART_BANNER.as_bytes()).is_ok() {
                self.notify_output();
            }
            let (cols, rows) = self.size().unwrap_or((80, 24));
            match self.spawn_process(cols, rows) {
                Ok(new_pid) => pid = new_pid,
                Err(e) => {
                    tracing::error!(session_id = %self.inner.id, error = %e, "failed to restart shell");
                    let message = format!("[Restart failed: {}]\r\n", e);
                    if self.inner.output.write(message.as_bytes()).is_ok() {
                        self.notify_output();
                    }
                    self.finalize(status, true);
                    return;
                }
            }
        }
    }

    /// Tear down the current process plumbing, in order: stop the reader,
    /// emit the exit banner, record the status, close the input queue and
    /// join the writer, then close the master.
    fn cleanup_resources(&self, exit_status: i32) {
        let Some(mut io) = lock(&self.inner.io).take() else {
            return;
        };

        if let Some(reader) = io.reader.take() {
            reader.finish();
        }
        if self.inner.kind != SessionKind::Log {
            let banner = exit_banner(exit_status);
            if self.inner.output.write(banner.as_bytes()).is_ok() {
                self.notify_output();
            }
        }

        self.inner.exit_status.store(exit_status, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(input) = io.input.take() {
            input.close();
        }
        if let Some(writer) = io.writer.take() {
            if writer.join().is_err() {
                tracing::error!(session_id = %self.inner.id, "writer pump panicked");
            }
        }
        drop(io.master);
    }

    /// Final transition: no more output will ever be produced.
    fn finalize(&self, exit_status: i32, notify: bool) {
        self.inner.exit_status.store(exit_status, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.output.close();
        lock(&self.inner.log_slave).take();
        lock(&self.inner.log_source).take();

        *lock(&self.inner.done) = true;
        self.inner.done_cv.notify_all();

        if notify {
            let _ = self.inner.ctx.events.send(SessionEvent::Finished {
                id: self.inner.id,
                exit_status,
            });
        }
    }

    /// Queue input for the process. Dropped silently for log sessions and
    /// when no process is running.
    pub fn write(&self, data: &[u8]) {
        if self.inner.kind == SessionKind::Log || !self.is_running() {
            return;
        }
        let input = lock(&self.inner.io)
            .as_ref()
            .and_then(|io| io.input.clone());
        if let Some(input) = input {
            if input.write(data).is_err() {
                tracing::debug!(session_id = %self.inner.id, "input dropped, process is gone");
            }
        }
    }

    /// Send SIGKILL to the running process. A shell comes back on its own.
    pub fn finish_if_running(&self) {
        if self.inner.kind == SessionKind::Log || !self.is_running() {
            return;
        }
        let pid = self.pid();
        if pid != 0 {
            kill_pid(pid);
        }
    }

    /// Stop the session for good and wait until it is cleaned up.
    pub fn shutdown(&self) {
        {
            let phase = lock(&self.inner.phase);
            if self.inner.stopping.swap(true, Ordering::SeqCst) && self.is_finished() {
                return;
            }
            // Unblocks a reader stuck on a full queue nobody drains anymore.
            self.inner.output.close();

            match (*phase, self.inner.kind) {
                (Phase::Created, _) => {
                    drop(phase);
                    self.finalize(0, false);
                    return;
                }
                (Phase::Started, SessionKind::Log) => {
                    if !self.is_finished() {
                        self.cleanup_resources(0);
                        self.finalize(0, true);
                    }
                }
                (Phase::Started, _) => self.finish_if_running(),
            }
        }

        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(handle) = supervisor {
            if handle.join().is_err() {
                tracing::error!(session_id = %self.inner.id, "waiter thread panicked");
            }
        }

        let mut done = lock(&self.inner.done);
        while !*done {
            done = self
                .inner
                .done_cv
                .wait(done)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Move everything in the output queue into the emulator.
    pub fn process_output(&self) -> usize {
        let mut emulator = lock(&self.inner.emulator);
        let Some(emulator) = emulator.as_mut() else {
            return 0;
        };
        let mut buf = [0u8; 4096];
        let mut total = 0;
        while let Ok(n) = self.inner.output.read(&mut buf, false) {
            if n == 0 {
                break;
            }
            emulator.append(&buf[..n]);
            total += n;
        }
        total
    }

    /// Text the emulator holds for this session.
    pub fn transcript(&self) -> String {
        lock(&self.inner.emulator)
            .as_ref()
            .map(|emulator| emulator.transcript_text())
            .unwrap_or_default()
    }

    /// Writable slave side of a local log session's own pty.
    pub fn log_writer(&self) -> Option<File> {
        lock(&self.inner.log_slave)
            .as_ref()
            .and_then(|fd| fd.try_clone().ok())
            .map(File::from)
    }
}

fn kill_pid(pid: u32) {
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid = pid, "sent SIGKILL"),
        Err(Errno::ESRCH) => tracing::debug!(pid = pid, "process already gone"),
        Err(e) => tracing::warn!(pid = pid, error = %e, "failed to kill process"),
    }
}

/// Block until `pid` terminates: `Exited(n)` gives n, `Signaled(s)` gives -s.
fn wait_for_exit(pid: u32) -> i32 {
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => return -(signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "waitpid failed, exit status unknown");
                return EXIT_STATUS_UNKNOWN;
            }
        }
    }
}
