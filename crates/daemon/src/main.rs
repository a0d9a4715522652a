//! termbroker
//!
//! Local terminal-session broker daemon and its command-line client.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::{Opcode, Payload, Registration, SessionSummary};
use termbroker::config::Config;
use termbroker::ipc::pidfile::read_pid_file;
use termbroker::ipc::{
    get_broker_socket_path, get_control_socket_path, get_daemon_pid, get_pid_file_path, IpcClient,
    IpcResponse,
};
use termbroker::rpc::{Endpoint, Outbound};
use termbroker::service::{BrokerService, ServiceEvent};
use termbroker::{transport, PtyPair};
use tracing_subscriber::EnvFilter;

/// Timeout for one request to a running broker.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// termbroker - hosts pty-backed terminal sessions for local clients.
#[derive(Parser, Debug)]
#[command(name = "termbroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the broker daemon
    Start {
        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Ask the broker to terminate all sessions and stop
    StopService,

    /// Keep the host awake while sessions run
    EnableWakelock,

    /// Release the wake lock
    DisableWakelock,

    /// Manage hosted sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Run a command on a new pty and register it as a tracked process
    Track {
        /// Identity shown in session names (defaults to the program name)
        #[arg(long)]
        identity: Option<String>,

        /// Command line to run
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all hosted sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Shut down and remove a session
    Remove {
        /// Session ID to remove
        session_id: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    let socket_dir = config.service.socket_dir.clone();
    let control_socket = get_control_socket_path(socket_dir.as_deref());
    let broker_socket = get_broker_socket_path(socket_dir.as_deref());

    match cli.command {
        Commands::Start { foreground } => {
            if let Some(pid) = get_daemon_pid(&config.daemon.data_dir) {
                eprintln!("Error: Broker already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop it, run:");
                eprintln!("  termbroker stop");
                std::process::exit(1);
            }

            if foreground {
                run_foreground(&config).await?;
            } else {
                spawn_detached(cli.config.as_deref(), &control_socket).await?;
            }
        }
        Commands::Stop { force, timeout } => {
            let result = if force {
                force_stop_daemon(&config.daemon.data_dir, &control_socket, &broker_socket)
            } else {
                graceful_stop_daemon(&control_socket, timeout).await
            };
            match result {
                Ok(()) => println!("Broker stopped"),
                Err(e) => {
                    eprintln!("Failed to stop broker: {}", e);
                    if !force {
                        eprintln!("Try: termbroker stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let mut client = match control_client(&control_socket).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };
            match client.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    session_count,
                    tracked_count,
                    client_count,
                    wake_lock_held,
                } => {
                    println!(
                        "Broker Status: {}",
                        if running { "running" } else { "stopping" }
                    );
                    println!("  Uptime:    {}", format_duration(uptime_secs));
                    println!("  Sessions:  {}", session_count);
                    println!("  Tracked:   {}", tracked_count);
                    println!("  Clients:   {}", client_count);
                    println!("  Wake lock: {}", if wake_lock_held { "held" } else { "released" });
                }
                other => fail_with_response(other),
            }
        }
        Commands::StopService => {
            stop_service(&broker_socket).await?;
            println!("Broker is terminating");
        }
        Commands::EnableWakelock => set_wake_lock(&control_socket, true).await?,
        Commands::DisableWakelock => set_wake_lock(&control_socket, false).await?,
        Commands::Sessions(SessionsCommands::List { json }) => {
            match control_client(&control_socket).await?.list_sessions().await? {
                IpcResponse::Sessions { sessions } => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                other => fail_with_response(other),
            }
        }
        Commands::Sessions(SessionsCommands::Remove { session_id }) => {
            match control_client(&control_socket)
                .await?
                .remove_session(session_id)
                .await?
            {
                IpcResponse::SessionRemoved { session_id } => {
                    println!("Session {} removed", session_id)
                }
                other => fail_with_response(other),
            }
        }
        Commands::Track { identity, command } => {
            let code = track(&broker_socket, &config, identity, command).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

/// Connect to a running broker's control socket.
async fn control_client(socket: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket, REQUEST_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Broker is not running (cannot connect to socket)"))
}

async fn set_wake_lock(socket: &Path, held: bool) -> anyhow::Result<()> {
    match control_client(socket).await?.set_wake_lock(held).await? {
        IpcResponse::WakeLock { held } => {
            println!("Wake lock {}", if held { "held" } else { "released" });
            Ok(())
        }
        other => fail_with_response(other),
    }
}

fn fail_with_response(response: IpcResponse) -> ! {
    match response {
        IpcResponse::Error { message } => eprintln!("Broker returned error: {}", message),
        other => eprintln!("Unexpected response from broker: {:?}", other),
    }
    std::process::exit(1);
}

/// Run the service until a signal arrives or the broker stops itself.
async fn run_foreground(config: &Config) -> anyhow::Result<()> {
    let mut service = BrokerService::new(config);
    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServiceEvent::StateChanged(state) => tracing::info!("Service state: {:?}", state),
                ServiceEvent::Error { message } => tracing::error!("Service error: {}", message),
            }
        }
    });

    service.start().await?;

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = service.stopped() => tracing::info!("Broker stopped itself"),
    }

    service.stop().await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// Re-run ourselves in the foreground, detached from this terminal, and wait
/// until the control socket answers.
async fn spawn_detached(config: Option<&Path>, control_socket: &Path) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Cannot locate the termbroker executable")?;
    let mut command = std::process::Command::new(exe);
    if let Some(path) = config {
        command.arg("--config").arg(path);
    }
    let child = command
        .args(["start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("Failed to start the broker")?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if let Ok(mut client) =
            IpcClient::connect_with_timeout(control_socket, Duration::from_millis(200)).await
        {
            if client.ping().await.unwrap_or(false) {
                println!("Broker started (PID: {})", child.id());
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("Broker did not come up within 10s")
}

/// Stop the broker via the control socket and wait for it to go away.
async fn graceful_stop_daemon(control_socket: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = control_client(control_socket).await?;

    println!("Sending shutdown request...");
    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for broker to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Broker returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from broker"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !control_socket.exists()
            || IpcClient::connect_with_timeout(control_socket, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for broker to exit ({}s)", timeout_secs)
}

/// Kill the broker named in the pid file with SIGKILL.
fn force_stop_daemon(data_dir: &Path, control_socket: &Path, broker_socket: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path(data_dir);
    let pid = read_pid_file(&pid_path)
        .ok_or_else(|| anyhow::anyhow!("Broker PID file not found - is the broker running?"))?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill broker (PID {})", pid))?;
    println!("Sent SIGKILL to broker (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(control_socket);
    let _ = std::fs::remove_file(broker_socket);
    Ok(())
}

/// Send TERMINATE over the RPC socket.
async fn stop_service(broker_socket: &Path) -> anyhow::Result<()> {
    let endpoint = Endpoint::new("termbroker-cli");
    let _conn = transport::connect(broker_socket, &endpoint)
        .await
        .context("Broker is not running (cannot connect to socket)")?;
    let reply = endpoint
        .send_blocking_timeout(Outbound::new(Opcode::TERMINATE), REQUEST_TIMEOUT)
        .await?;
    if reply.opcode() != Opcode::TERMINATING {
        anyhow::bail!("Unexpected reply {:?}", reply.opcode());
    }
    Ok(())
}

/// Run `command` on a fresh pty, hand the pty to the broker as a tracked
/// process, and return the command's exit code.
async fn track(
    broker_socket: &Path,
    config: &Config,
    identity: Option<String>,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No command given"))?;
    let identity = identity.unwrap_or_else(|| {
        Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone())
    });

    // Connect before spawning so a missing broker never leaves a child behind.
    let endpoint = Endpoint::new("termbroker-track");
    let conn = transport::connect(broker_socket, &endpoint)
        .await
        .context("Broker is not running (cannot connect to socket)")?;

    let pair = PtyPair::open(config.session.default_cols, config.session.default_rows)?;
    let mut child = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(pair.slave_stdio()?)
        .stderr(pair.slave_stdio()?)
        .spawn()
        .with_context(|| format!("Failed to run {}", program))?;

    let mut registration = Registration::new(identity.clone(), child.id() as i32);
    registration.label = program.clone();
    registration.description = command.join(" ");

    let registered: anyhow::Result<i32> = async {
        let reply = endpoint
            .send_blocking_timeout(
                Outbound::new(Opcode::REGISTER_TRACKED_PROCESS)
                    .with_payload(Payload::Registration(registration))
                    .with_attachment(pair),
                REQUEST_TIMEOUT,
            )
            .await?;
        match (reply.opcode(), &reply.envelope.payload) {
            (Opcode::REGISTERED_TRACKED_PROCESS, _) => Ok::<i32, anyhow::Error>(reply.envelope.arg1),
            (_, Payload::Failure(failure)) => {
                anyhow::bail!("Broker refused registration: {}", failure.reason)
            }
            (opcode, _) => anyhow::bail!("Unexpected reply {:?}", opcode),
        }
    }
    .await;
    drop(conn);

    match registered {
        Ok(tracked_id) => tracing::info!(
            tracked_id = tracked_id,
            identity = %identity,
            pid = child.id(),
            "registered as tracked process"
        ),
        Err(e) => {
            tokio::task::spawn_blocking(move || abandon_child(&mut child)).await?;
            return Err(e);
        }
    }

    let status = tokio::task::spawn_blocking(move || child.wait()).await??;
    Ok(status.code().unwrap_or(1))
}

/// Kill and reap a child we no longer want.
fn abandon_child(child: &mut std::process::Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::warn!(pid = pid, error = %e, "failed to kill child");
    }
    match child.wait() {
        Ok(status) => tracing::debug!(pid = pid, status = %status, "child reaped"),
        Err(e) => tracing::warn!(pid = pid, error = %e, "failed to reap child"),
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let name_width = sessions
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:>4}  {:<7}  {:<name_width$}  {:>7}  {:<10}",
        "ID",
        "KIND",
        "NAME",
        "PID",
        "STATE",
        name_width = name_width
    );
    println!("{}", "-".repeat(name_width + 38));

    for session in sessions {
        let state = if session.running {
            "running".to_string()
        } else {
            format!("exited {}", session.exit_status)
        };
        println!(
            "{:>4}  {:<7}  {:<name_width$}  {:>7}  {:<10}",
            session.id,
            format!("{:?}", session.kind).to_lowercase(),
            session.name,
            session.pid,
            state,
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
