//! Broker service: wires the broker to its sockets and pid file.
//!
//! [`BrokerService`] owns one [`Broker`], the framed RPC listener clients
//! and tracked processes connect to, and the JSON control socket the CLI
//! talks to. It stops when asked to, on a signal, or when the broker
//! terminates itself (TERMINATE opcode, or stop-when-idle).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerSettings};
use crate::config::Config;
use crate::ipc::pidfile::{remove_pid_file, write_pid_file};
use crate::ipc::{
    get_broker_socket_path, get_control_socket_path, get_pid_file_path, IpcRequest, IpcResponse,
    IpcServer,
};
use crate::session::SessionId;
use crate::transport::RpcListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    StateChanged(ServiceState),
    Error { message: String },
}

pub struct BrokerService {
    broker: Broker,
    state: Arc<RwLock<ServiceState>>,
    broker_socket: PathBuf,
    control_socket: PathBuf,
    pid_file: PathBuf,
    started_at: Instant,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ServiceEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerService {
    pub fn new(config: &Config) -> Self {
        let socket_dir = config.service.socket_dir.as_deref();
        let (event_tx, _) = broadcast::channel(64);
        Self {
            broker: Broker::new(BrokerSettings::from_config(config)),
            state: Arc::new(RwLock::new(ServiceState::Stopped)),
            broker_socket: get_broker_socket_path(socket_dir),
            control_socket: get_control_socket_path(socket_dir),
            pid_file: get_pid_file_path(&config.daemon.data_dir),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            event_tx,
            tasks: Vec::new(),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_socket(&self) -> &PathBuf {
        &self.broker_socket
    }

    pub fn control_socket(&self) -> &PathBuf {
        &self.control_socket
    }

    pub async fn state(&self) -> ServiceState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_tx.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the broker and begin accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServiceState::Stopped {
                anyhow::bail!("Service is already running");
            }
            *state = ServiceState::Starting;
        }
        self.emit(ServiceEvent::StateChanged(ServiceState::Starting));
        info!("Starting broker service...");

        let local = self.broker.start();

        let listener = RpcListener::bind(&self.broker_socket)
            .with_context(|| format!("Failed to bind {}", self.broker_socket.display()))?;
        let control = IpcServer::bind(&self.control_socket)
            .await
            .with_context(|| format!("Failed to bind {}", self.control_socket.display()))?;
        write_pid_file(&self.pid_file)
            .with_context(|| format!("Failed to write {}", self.pid_file.display()))?;

        let shutdown = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.serve(local, shutdown).await {
                warn!(error = %e, "rpc listener stopped");
                let _ = event_tx.send(ServiceEvent::Error {
                    message: e.to_string(),
                });
            }
        }));

        let broker = self.broker.clone();
        let started_at = self.started_at;
        let shutdown = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            let handler = move |request| handle_control(&broker, started_at, request);
            if let Err(e) = control.serve(handler, shutdown).await {
                warn!(error = %e, "control socket stopped");
            }
        }));

        // A broker that terminates itself takes the service down with it.
        let broker_done = self.broker.shutdown_token();
        let shutdown = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = broker_done.cancelled() => {
                    debug!("broker terminated, stopping service");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }));

        *self.state.write().await = ServiceState::Running;
        self.emit(ServiceEvent::StateChanged(ServiceState::Running));
        info!(
            rpc = %self.broker_socket.display(),
            control = %self.control_socket.display(),
            "Broker service started"
        );
        Ok(())
    }

    /// Resolve once the service has been asked to stop by anyone.
    pub async fn stopped(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// Terminate the broker and release the sockets and pid file.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServiceState::Stopped => return Ok(()),
                ServiceState::ShuttingDown => anyhow::bail!("Service is already shutting down"),
                _ => *state = ServiceState::ShuttingDown,
            }
        }
        self.emit(ServiceEvent::StateChanged(ServiceState::ShuttingDown));
        info!("Stopping broker service...");

        let broker = self.broker.clone();
        tokio::task::spawn_blocking(move || broker.terminate())
            .await
            .context("broker terminate panicked")?;
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        remove_pid_file(&self.pid_file);

        *self.state.write().await = ServiceState::Stopped;
        self.emit(ServiceEvent::StateChanged(ServiceState::Stopped));
        info!("Broker service stopped");
        Ok(())
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Answer one control request. Runs on the blocking pool.
pub(crate) fn handle_control(broker: &Broker, started_at: Instant, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::Status => {
            let status = broker.status();
            IpcResponse::Status {
                running: !status.wants_to_stop,
                uptime_secs: started_at.elapsed().as_secs(),
                session_count: status.sessions,
                tracked_count: status.tracked_processes,
                client_count: status.clients,
                wake_lock_held: status.wake_lock_held,
            }
        }
        IpcRequest::Stop => {
            // Answer first; the service winds down once the broker is done.
            let broker = broker.clone();
            std::thread::spawn(move || broker.terminate());
            IpcResponse::Stopping
        }
        IpcRequest::ListSessions => IpcResponse::Sessions {
            sessions: broker.summaries(),
        },
        IpcRequest::RemoveSession { session_id } => {
            match broker.remove_session(SessionId(session_id)) {
                Ok(()) => IpcResponse::SessionRemoved { session_id },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        IpcRequest::SetWakeLock { held } => {
            broker.set_wake_lock(held);
            IpcResponse::WakeLock {
                held: broker.wake_lock_held(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().join("data");
        config.service.socket_dir = Some(temp_dir.path().join("run"));
        config.session.default_shell = "/bin/sh".to_string();
        config.session.logcat_program = "cat".to_string();
        config
    }

    #[tokio::test]
    async fn test_service_creation() {
        let temp_dir = TempDir::new().unwrap();
        let service = BrokerService::new(&create_test_config(&temp_dir));
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(service.broker_socket().ends_with("run/broker.sock"));
        assert!(service.control_socket().ends_with("run/control.sock"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = BrokerService::new(&create_test_config(&temp_dir));
        let mut events = service.subscribe();

        service.start().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Running);
        assert!(service.broker_socket().exists());
        let pid_file = temp_dir.path().join("data").join("daemon.pid");
        assert!(pid_file.exists());
        assert!(service.start().await.is_err());

        let mut client = IpcClient::connect(service.control_socket()).await.unwrap();
        assert!(client.ping().await.unwrap());

        service.stop().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(!pid_file.exists());
        assert!(service.broker().wants_to_stop());

        assert!(matches!(
            events.recv().await.unwrap(),
            ServiceEvent::StateChanged(ServiceState::Starting)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_control_stop_ends_service() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = BrokerService::new(&create_test_config(&temp_dir));
        service.start().await.unwrap();

        let mut client = IpcClient::connect(service.control_socket()).await.unwrap();
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);

        tokio::time::timeout(std::time::Duration::from_secs(10), service.stopped())
            .await
            .unwrap();
        service.stop().await.unwrap();
    }

    #[test]
    fn test_handle_control_requests() {
        let broker = Broker::new(BrokerSettings::default());
        let started_at = Instant::now();

        assert_eq!(
            handle_control(&broker, started_at, IpcRequest::Ping),
            IpcResponse::Pong
        );
        assert_eq!(
            handle_control(&broker, started_at, IpcRequest::ListSessions),
            IpcResponse::Sessions { sessions: vec![] }
        );
        assert_eq!(
            handle_control(&broker, started_at, IpcRequest::SetWakeLock { held: true }),
            IpcResponse::WakeLock { held: true }
        );
        assert!(matches!(
            handle_control(&broker, started_at, IpcRequest::RemoveSession { session_id: 99 }),
            IpcResponse::Error { .. }
        ));
        match handle_control(&broker, started_at, IpcRequest::Status) {
            IpcResponse::Status {
                running,
                session_count,
                wake_lock_held,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 0);
                assert!(wake_lock_held);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
