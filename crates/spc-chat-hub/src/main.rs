mod broadcast;
mod channel;
mod relay;
mod supervisor;

use clap::Parser;
use spc_core::{AgentRegistry, CoreError, DEFAULT_PORT};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::channel::{ChannelConfig, ChannelState, HISTORY_CAPACITY};
use crate::relay::RelayState;
use crate::supervisor::{
    IdleSupervisor, LifecycleEvent, ShutdownReason, SupervisorHandle, SHUTDOWN_FLUSH,
};

const PORT_SCAN_SPAN: u16 = 100;
const BIND_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

#[derive(Clone, Debug)]
struct Config {
    port: u16,
    open_browser: bool,
    feature: Option<String>,
    idle_timeout: Option<Duration>,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "spc-chat-hub")]
struct Args {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value_t = false)]
    no_open: bool,
    #[arg(long, default_value = "")]
    feature: String,
    /// Idle shutdown in minutes; 0 disables it.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("no free port in {start}..={end}")]
    NoAvailablePort { start: u16, end: u16 },
    #[error("channel setup failed: {0}")]
    Channel(#[from] CoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = load_config();
    let _log_guard = init_logging(&config);
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "startup_error", error = %err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let channel = Arc::new(ChannelState::new(
        AgentRegistry::default_team(),
        ChannelConfig {
            feature: config.feature.clone(),
            idle_timeout: config.idle_timeout,
            history_capacity: HISTORY_CAPACITY,
        },
    )?);

    let listener = bind_first_free(config.port, PORT_SCAN_SPAN).await?;
    let addr = listener.local_addr()?;

    let (supervisor, lifecycle) = IdleSupervisor::new(channel.clone());
    tokio::spawn(forward_signals(lifecycle.clone()));

    let url = viewer_url(addr);
    info!(
        event = "hub_start",
        addr = %addr,
        feature = config.feature.as_deref().unwrap_or(""),
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
        "SPC Chat UI running at {url}"
    );
    if config.open_browser {
        launch_browser(url);
    }

    let reason = serve_until_shutdown(listener, channel.clone(), supervisor, lifecycle).await?;
    info!(
        event = "hub_stopped",
        reason = %reason,
        messages = channel.message_count()
    );
    Ok(())
}

/// The bound listener is IPv4 loopback, so the URL names it directly.
fn viewer_url(addr: SocketAddr) -> String {
    format!("http://{}:{}", Ipv4Addr::LOCALHOST, addr.port())
}

/// Serve until the lifecycle reaches `ShuttingDown`, give the close frames
/// `SHUTDOWN_FLUSH` to drain, then stop the server and release the listener.
async fn serve_until_shutdown(
    listener: TcpListener,
    channel: Arc<ChannelState>,
    supervisor: IdleSupervisor,
    lifecycle: SupervisorHandle,
) -> Result<ShutdownReason, StartupError> {
    let supervisor_task = tokio::spawn(supervisor.run());
    let app = relay::router(RelayState {
        channel,
        lifecycle: lifecycle.clone(),
    });

    let graceful = {
        let lifecycle = lifecycle.clone();
        async move {
            let reason = lifecycle.wait_for_shutdown().await;
            debug!(event = "graceful_shutdown", reason = %reason);
        }
    };
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .await
    });

    let reason = tokio::select! {
        reason = lifecycle.wait_for_shutdown() => reason,
        result = &mut server => {
            supervisor_task.abort();
            return match result {
                Ok(Ok(())) => Ok(lifecycle.wait_for_shutdown().await),
                Ok(Err(err)) => Err(StartupError::Io(err)),
                Err(err) => Err(StartupError::Io(io::Error::new(io::ErrorKind::Other, err))),
            };
        }
    };
    info!(event = "hub_stopping", reason = %reason);

    tokio::time::sleep(SHUTDOWN_FLUSH).await;
    server.abort();
    let _ = server.await;
    supervisor_task.abort();
    Ok(reason)
}

/// First listener that binds on `127.0.0.1` in `start..start+span`.
async fn bind_first_free(start: u16, span: u16) -> Result<TcpListener, StartupError> {
    let end = start.saturating_add(span.saturating_sub(1));
    for port in start..=end {
        match tokio::time::timeout(BIND_TIMEOUT, TcpListener::bind((Ipv4Addr::LOCALHOST, port))).await {
            Ok(Ok(listener)) => {
                if port != start {
                    info!(event = "port_fallback", requested = start, bound = port);
                }
                return Ok(listener);
            }
            Ok(Err(err)) => debug!(event = "port_busy", port = port, error = %err),
            Err(_) => debug!(event = "port_bind_timeout", port = port),
        }
    }
    Err(StartupError::NoAvailablePort { start, end })
}

async fn forward_signals(lifecycle: SupervisorHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                let event = tokio::select! {
                    _ = tokio::signal::ctrl_c() => LifecycleEvent::Interrupted,
                    _ = term.recv() => LifecycleEvent::Terminated,
                };
                lifecycle.send(event).await;
                return;
            }
            Err(err) => warn!(event = "signal_error", error = %err),
        }
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        lifecycle.send(LifecycleEvent::Interrupted).await;
    }
}

fn launch_browser(url: String) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = open::that(&url) {
            warn!(event = "browser_open_failed", url = %url, error = %err);
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    let port = resolve_port(args.port);
    let open_browser = !args.no_open;
    let feature = resolve_feature(&args.feature);
    let idle_timeout = idle_timeout_from_minutes(resolve_timeout_minutes(args.timeout));
    let debug = args.debug || env_true("SPC_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    Config {
        port,
        open_browser,
        feature,
        idle_timeout,
        debug,
        log_dir,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("SPC_LOG_LEVEL") {
        level
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, config.port) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, port: u16) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("spc-chat-hub-{port}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_port(port_flag: Option<u16>) -> u16 {
    if let Some(port) = port_flag {
        return port;
    }
    match env_value("SPC_CHAT_PORT").map(|value| value.parse::<u16>()) {
        Some(Ok(port)) => port,
        Some(Err(err)) => {
            eprintln!("invalid SPC_CHAT_PORT ({err}), using {DEFAULT_PORT}");
            DEFAULT_PORT
        }
        None => DEFAULT_PORT,
    }
}

fn resolve_feature(feature_flag: &str) -> Option<String> {
    if !feature_flag.trim().is_empty() {
        return Some(feature_flag.trim().to_string());
    }
    env_value("SPC_FEATURE")
}

fn resolve_timeout_minutes(timeout_flag: Option<u64>) -> u64 {
    if let Some(minutes) = timeout_flag {
        return minutes;
    }
    env_value("SPC_IDLE_TIMEOUT")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MINUTES)
}

fn idle_timeout_from_minutes(minutes: u64) -> Option<Duration> {
    if minutes == 0 {
        None
    } else {
        Some(Duration::from_secs(minutes.saturating_mul(60)))
    }
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("SPC_LOG_DIR").unwrap_or_else(|| ".spc/logs".to_string())
}
