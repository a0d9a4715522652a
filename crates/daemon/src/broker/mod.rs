//! Session broker.
//!
//! The broker owns the session list, the tracked-process registry and the
//! client registry, answers the RPC opcodes, and watches tracked processes
//! so their sessions disappear together with them.
//!
//! Lock order: the session list before the tracked registry. Neither lock
//! is held while a session shuts down.

mod clients;
mod handlers;
pub mod host;
pub mod liveness;
pub mod registry;

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use protocol::{Opcode, Registration, SessionSummary};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use clients::ClientRegistry;
pub use host::{HostEnvironment, LoggingHost, RecordingHost};
pub use liveness::{LivenessProbe, ManualProbe, ProcfsProbe};
pub use registry::{TrackedProcess, TrackedRegistry};

use crate::config::Config;
use crate::pty::PtyPair;
use crate::rpc::{Endpoint, Outbound, PeerHandle};
use crate::session::{
    scrollback_factory, CommandSpec, LogSource, SessionContext, SessionError, SessionEvent,
    SessionId, SessionKind, SessionOrigin, TerminalSession, TrackedId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("invalid registration for {identity:?} (pid {pid})")]
    InvalidRegistration { identity: String, pid: i32 },

    #[error("registration carries no registration record")]
    MissingRegistration,

    #[error("registration carries no pty pair")]
    MissingPtyPair,

    #[error("broker is terminating")]
    Terminating,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Notifications for in-process observers of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    SessionsChanged,
    SessionOutput(SessionId),
    SessionResized { id: SessionId, cols: u16, rows: u16 },
    SessionFinished { id: SessionId, exit_status: i32 },
    TrackedRegistered { id: TrackedId, identity: String, pid: i32 },
    TrackedDied { id: TrackedId, identity: String, pid: i32 },
    Terminating,
}

/// Everything the broker needs from the configuration.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub shell: CommandSpec,
    pub logcat_program: String,
    pub scrollback_lines: usize,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub default_size: (u16, u16),
    pub stop_when_idle: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: CommandSpec::new(config.session.default_shell.clone())
                .args(config.session.shell_args.iter().cloned()),
            logcat_program: config.session.logcat_program.clone(),
            scrollback_lines: config.session.scrollback_lines,
            queue_capacity: config.broker.queue_capacity,
            poll_interval: config.broker.poll_interval(),
            default_size: (config.session.default_cols, config.session.default_rows),
            stop_when_idle: config.service.stop_when_idle,
        }
    }
}

/// Snapshot of broker state for status reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub sessions: usize,
    pub tracked_processes: usize,
    pub clients: usize,
    pub wants_to_stop: bool,
    pub wake_lock_held: bool,
}

struct BrokerInner {
    settings: BrokerSettings,
    endpoint: Endpoint,
    sessions: Mutex<Vec<TerminalSession>>,
    tracked: Mutex<TrackedRegistry>,
    clients: ClientRegistry,
    next_session_id: AtomicU64,
    wants_to_stop: AtomicBool,
    wake_lock: AtomicBool,
    started: AtomicBool,
    events: broadcast::Sender<BrokerEvent>,
    session_ctx: SessionContext,
    session_events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    probe: Arc<dyn LivenessProbe>,
    host: Arc<dyn HostEnvironment>,
    shutdown: CancellationToken,
}

/// Handle on the broker. Clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("status", &self.status()).finish()
    }
}

impl Broker {
    /// Broker with the procfs liveness probe and a logging host.
    pub fn new(settings: BrokerSettings) -> Self {
        Self::with_parts(settings, Arc::new(ProcfsProbe), Arc::new(LoggingHost))
    }

    pub fn with_parts(
        settings: BrokerSettings,
        probe: Arc<dyn LivenessProbe>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let mut session_ctx =
            SessionContext::new(session_tx, scrollback_factory(settings.scrollback_lines));
        session_ctx.queue_capacity = settings.queue_capacity;

        Self {
            inner: Arc::new(BrokerInner {
                settings,
                endpoint: Endpoint::new("broker"),
                sessions: Mutex::new(Vec::new()),
                tracked: Mutex::new(TrackedRegistry::new()),
                clients: ClientRegistry::new(),
                next_session_id: AtomicU64::new(1),
                wants_to_stop: AtomicBool::new(false),
                wake_lock: AtomicBool::new(false),
                started: AtomicBool::new(false),
                events,
                session_ctx,
                session_events: Mutex::new(Some(session_rx)),
                probe,
                host,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install the opcode handlers and start the dispatcher, the session
    /// event loop and the liveness poller. Returns the broker's peer handle.
    ///
    /// Must run inside a tokio runtime. Later calls only return the handle.
    pub fn start(&self) -> PeerHandle {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return self.inner.endpoint.handle();
        }

        handlers::install(&self.inner);

        let weak = Arc::downgrade(&self.inner);
        self.inner.endpoint.on_peer_gone(move |peer| {
            if let Some(inner) = weak.upgrade() {
                if inner.clients.unregister(peer) {
                    debug!(peer = %peer, "client unregistered after failed send");
                }
            }
        });

        let handle = self.inner.endpoint.start();

        if let Some(rx) = lock(&self.inner.session_events).take() {
            tokio::spawn(session_event_loop(
                Arc::downgrade(&self.inner),
                rx,
                self.inner.shutdown.clone(),
            ));
        }
        tokio::spawn(liveness_loop(
            Arc::downgrade(&self.inner),
            self.inner.settings.poll_interval,
            self.inner.shutdown.clone(),
        ));

        info!(
            poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "broker started"
        );
        handle
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn handle(&self) -> PeerHandle {
        self.inner.endpoint.handle()
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Cancelled once the broker terminates.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.inner.clients
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn next_session_id(&self) -> SessionId {
        SessionId(self.inner.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    // ==== Session list ====

    pub fn sessions(&self) -> Vec<TerminalSession> {
        lock(&self.inner.sessions).clone()
    }

    pub fn session(&self, id: SessionId) -> Option<TerminalSession> {
        lock(&self.inner.sessions)
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        lock(&self.inner.sessions)
            .iter()
            .map(TerminalSession::summary)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.sessions).is_empty()
    }

    pub fn wants_to_stop(&self) -> bool {
        self.inner.wants_to_stop.load(Ordering::SeqCst)
    }

    pub fn wake_lock_held(&self) -> bool {
        self.inner.wake_lock.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            sessions: lock(&self.inner.sessions).len(),
            tracked_processes: lock(&self.inner.tracked).len(),
            clients: self.inner.clients.len(),
            wants_to_stop: self.wants_to_stop(),
            wake_lock_held: self.wake_lock_held(),
        }
    }

    /// Add a session, start it when a size is given, and announce it.
    fn add_session(
        &self,
        session: TerminalSession,
        size: Option<(u16, u16)>,
    ) -> Result<TerminalSession, BrokerError> {
        if self.wants_to_stop() {
            return Err(BrokerError::Terminating);
        }
        lock(&self.inner.sessions).push(session.clone());

        if let Some((cols, rows)) = size {
            if let Err(e) = session.update_size(cols, rows) {
                warn!(session_id = %session.id(), error = %e, "session failed to start");
                self.discard(&session);
                return Err(e.into());
            }
        }

        info!(session_id = %session.id(), name = %session.name(), "session created");
        self.notify_sessions_changed();
        Ok(session)
    }

    /// Remove a session that never became visible to anyone.
    fn discard(&self, session: &TerminalSession) {
        session.shutdown();
        lock(&self.inner.sessions).retain(|s| s.id() != session.id());
        lock(&self.inner.tracked).dissociate(session.id());
    }

    pub fn create_shell_session(
        &self,
        size: Option<(u16, u16)>,
    ) -> Result<TerminalSession, BrokerError> {
        let session = TerminalSession::shell(
            self.next_session_id(),
            self.inner.settings.shell.clone(),
            self.inner.session_ctx.clone(),
        );
        self.add_session(session, size)
    }

    /// Logcat session following the broker's own pid.
    pub fn create_logcat_session(
        &self,
        size: Option<(u16, u16)>,
    ) -> Result<TerminalSession, BrokerError> {
        let command = CommandSpec::logcat(
            self.inner.settings.logcat_program.clone(),
            std::process::id() as i32,
        );
        let session = TerminalSession::logcat(
            self.next_session_id(),
            SessionOrigin::Local,
            command,
            self.inner.session_ctx.clone(),
        );
        self.add_session(session, size)
    }

    /// Log session over a fresh pty; write to it through `log_writer()`.
    pub fn create_log_session(
        &self,
        size: Option<(u16, u16)>,
    ) -> Result<TerminalSession, BrokerError> {
        let session = TerminalSession::log(
            self.next_session_id(),
            SessionOrigin::Local,
            LogSource::NewPair,
            std::process::id(),
            true,
            self.inner.session_ctx.clone(),
        );
        self.add_session(session, size)
    }

    /// Give a session its size, starting it if this is the first one.
    ///
    /// A zero size starts a never-sized session with the default size and
    /// leaves a running one alone.
    pub fn attach_session(
        &self,
        id: SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalSession, BrokerError> {
        let session = self.session(id).ok_or(BrokerError::SessionNotFound(id))?;
        if cols != 0 && rows != 0 {
            session.update_size(cols, rows)?;
        } else if session.size().is_none() {
            let (cols, rows) = self.inner.settings.default_size;
            session.update_size(cols, rows)?;
        }
        Ok(session)
    }

    /// Shut a session down and drop it from the list.
    pub fn remove_session(&self, id: SessionId) -> Result<(), BrokerError> {
        let session = self.session(id).ok_or(BrokerError::SessionNotFound(id))?;
        session.shutdown();
        lock(&self.inner.sessions).retain(|s| s.id() != id);
        lock(&self.inner.tracked).dissociate(id);
        info!(session_id = %id, "session removed");
        self.notify_sessions_changed();
        self.stop_if_idle();
        Ok(())
    }

    // ==== Tracked processes ====

    /// Register an external process and create its log and logcat sessions.
    ///
    /// The sessions start on their first attach.
    pub fn register_tracked_process(
        &self,
        registration: Registration,
        pty_pair: PtyPair,
    ) -> Result<TrackedId, BrokerError> {
        let id = self.register_tracked(registration, pty_pair)?;
        self.notify_sessions_changed();
        Ok(id)
    }

    /// Registration without the client broadcast, which the RPC handler
    /// sends only after its reply.
    fn register_tracked(
        &self,
        registration: Registration,
        pty_pair: PtyPair,
    ) -> Result<TrackedId, BrokerError> {
        if !registration.is_valid() {
            return Err(BrokerError::InvalidRegistration {
                identity: registration.identity,
                pid: registration.pid,
            });
        }
        if self.wants_to_stop() {
            return Err(BrokerError::Terminating);
        }

        let master = pty_pair.try_clone_master()?;
        let pid = registration.pid;

        // The entry becomes visible to the liveness poller together with its
        // sessions, so a cascade always finds them.
        let (tracked_id, origin) = {
            let mut sessions = lock(&self.inner.sessions);
            let mut tracked = lock(&self.inner.tracked);
            if self.wants_to_stop() {
                return Err(BrokerError::Terminating);
            }
            let id = tracked.insert(registration, pty_pair);
            let origin = tracked
                .get(id)
                .map(TrackedProcess::origin)
                .ok_or(BrokerError::MissingRegistration)?;

            let log = TerminalSession::log(
                self.next_session_id(),
                origin.clone(),
                LogSource::Master(master),
                pid as u32,
                false,
                self.inner.session_ctx.clone(),
            );
            let logcat = TerminalSession::logcat(
                self.next_session_id(),
                origin.clone(),
                CommandSpec::logcat(self.inner.settings.logcat_program.clone(), pid),
                self.inner.session_ctx.clone(),
            );
            tracked.associate(id, log.id());
            tracked.associate(id, logcat.id());
            sessions.extend([log, logcat]);
            (id, origin)
        };

        let identity = origin.identity().unwrap_or_default().to_string();
        info!(
            tracked_id = %tracked_id,
            identity = %identity,
            pid = pid,
            "tracked process registered"
        );
        self.emit(BrokerEvent::TrackedRegistered {
            id: tracked_id,
            identity,
            pid,
        });
        self.emit(BrokerEvent::SessionsChanged);
        Ok(tracked_id)
    }

    pub fn tracked_count(&self) -> usize {
        lock(&self.inner.tracked).len()
    }

    pub fn tracked_sessions(&self, id: TrackedId) -> Option<BTreeSet<SessionId>> {
        lock(&self.inner.tracked)
            .get(id)
            .map(|entry| entry.associated_sessions.clone())
    }

    /// Check every tracked process once and cascade the dead ones.
    ///
    /// Blocks while sessions shut down. Returns the removed entries.
    pub fn check_liveness(&self) -> Vec<TrackedId> {
        let snapshot = lock(&self.inner.tracked).snapshot();
        let mut removed = Vec::new();
        for (id, pid) in snapshot {
            if self.wants_to_stop() {
                break;
            }
            if !self.inner.probe.is_alive(pid) {
                self.cascade(id);
                removed.push(id);
            }
        }
        removed
    }

    /// Tear down one dead tracked process: sessions first, then its pty
    /// pair, then the entry itself.
    fn cascade(&self, id: TrackedId) {
        let Some((associated, identity, pid)) = lock(&self.inner.tracked)
            .get(id)
            .map(|e| (e.associated_sessions.clone(), e.identity.clone(), e.pid))
        else {
            return;
        };
        info!(tracked_id = %id, identity = %identity, pid = pid, "tracked process died");

        let doomed: Vec<TerminalSession> = lock(&self.inner.sessions)
            .iter()
            .filter(|s| associated.contains(&s.id()) || s.origin().tracked_id() == Some(id))
            .cloned()
            .collect();

        for session in &doomed {
            session.shutdown();
        }
        lock(&self.inner.sessions).retain(|s| !doomed.iter().any(|d| d.id() == s.id()));
        self.notify_sessions_changed();

        let pair = lock(&self.inner.tracked)
            .get_mut(id)
            .and_then(|entry| entry.pty_pair.take());
        drop(pair);
        lock(&self.inner.tracked).remove(id);

        debug!(tracked_id = %id, sessions = doomed.len(), "cascade complete");
        self.emit(BrokerEvent::TrackedDied { id, identity, pid });
        self.stop_if_idle();
    }

    // ==== Clients and lifecycle ====

    /// Send a message to every registered client, pruning the dead ones.
    pub fn broadcast<F>(&self, make: F) -> usize
    where
        F: Fn() -> Outbound,
    {
        self.inner.clients.broadcast(&self.inner.endpoint, make)
    }

    fn notify_sessions_changed(&self) {
        self.emit(BrokerEvent::SessionsChanged);
        self.broadcast_sessions_changed();
    }

    /// Tell every client the list changed; `arg1` carries the new length.
    fn broadcast_sessions_changed(&self) {
        let count = i32::try_from(lock(&self.inner.sessions).len()).unwrap_or(i32::MAX);
        self.broadcast(|| Outbound::new(Opcode::SESSIONS_CHANGED).with_args(count, 0));
    }

    pub fn set_wake_lock(&self, held: bool) {
        if self.inner.wake_lock.swap(held, Ordering::SeqCst) != held {
            self.inner.host.set_wake_lock(held);
        }
    }

    pub fn present_session_list(&self) {
        self.inner.host.present_session_list();
    }

    fn stop_if_idle(&self) {
        if self.inner.settings.stop_when_idle && !self.wants_to_stop() && self.is_empty() {
            info!("no sessions left, stopping");
            self.terminate();
        }
    }

    /// Stop everything for good.
    ///
    /// Kills and shuts down every session, tells the host, then cancels the
    /// shutdown token and closes the endpoint. Blocks until sessions are
    /// cleaned up. Calling it again is a no-op.
    pub fn terminate(&self) {
        if self.inner.wants_to_stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("broker terminating");
        self.emit(BrokerEvent::Terminating);

        let sessions: Vec<TerminalSession> = lock(&self.inner.sessions).drain(..).collect();
        for session in &sessions {
            session.finish_if_running();
            session.shutdown();
        }
        self.emit(BrokerEvent::SessionsChanged);

        if self.wake_lock_held() {
            self.set_wake_lock(false);
        }
        self.inner.host.stop_service();
        self.inner.shutdown.cancel();
        self.inner.endpoint.close();
        info!(sessions = sessions.len(), "broker terminated");
    }
}

async fn session_event_loop(
    inner: Weak<BrokerInner>,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let broker = Broker { inner };

        match event {
            SessionEvent::OutputAvailable(id) => {
                if let Some(session) = broker.session(id) {
                    session.process_output();
                    broker.emit(BrokerEvent::SessionOutput(id));
                }
            }
            SessionEvent::Resized { id, cols, rows } => {
                broker.emit(BrokerEvent::SessionResized { id, cols, rows });
            }
            SessionEvent::Finished { id, exit_status } => {
                let Some(session) = broker.session(id) else {
                    broker.emit(BrokerEvent::SessionFinished { id, exit_status });
                    continue;
                };
                session.process_output();
                broker.emit(BrokerEvent::SessionFinished { id, exit_status });
                debug!(session_id = %id, exit_status, "session finished");

                if session.kind() != SessionKind::Shell {
                    lock(&broker.inner.sessions).retain(|s| s.id() != id);
                    lock(&broker.inner.tracked).dissociate(id);
                    broker.notify_sessions_changed();
                }
                if broker.inner.settings.stop_when_idle && broker.is_empty() {
                    let broker = broker.clone();
                    tokio::task::spawn_blocking(move || broker.stop_if_idle());
                }
            }
        }
    }
    debug!("session event loop stopped");
}

async fn liveness_loop(inner: Weak<BrokerInner>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let broker = Broker { inner };
        match tokio::task::spawn_blocking(move || broker.check_liveness()).await {
            Ok(removed) if !removed.is_empty() => {
                debug!(count = removed.len(), "tracked processes removed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "liveness check panicked"),
        }
    }
    debug!("liveness poller stopped");
}
