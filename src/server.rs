//! The daemon side: singleton election, accept loop, per-connection dispatch.
//!
//! `listen()` runs the election first. The starting lock serializes the
//! critical section between binding the endpoint and committing leadership;
//! a would-be daemon that loses either the lock or the bind pings the
//! presumed peer before deciding whether to defer or usurp it. A peer that
//! holds the endpoint but cannot produce a valid pong within the budget is
//! treated as dead no matter what the PID file says.

use crate::error::{Result, SockdError};
use crate::frame;
use crate::lock::{self, StartingLock};
use crate::message;
use crate::paths::ServicePaths;
use crate::process::{self, Signal};
use crate::ready;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Server-wide inactivity limit before the daemon closes itself.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Per-connection receive-idle limit. Zero disables it.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// A freshly bound daemon that sees no traffic for this long closes:
/// it likely lost a race nobody is consuming.
const HERD_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer-check budget after losing the starting lock.
const LOCK_PEER_BUDGET: Duration = Duration::from_millis(1000);

/// Peer-check budget after losing the endpoint bind.
const BIND_PEER_BUDGET: Duration = Duration::from_millis(500);

/// Floor for a single handshake-ping attempt.
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(50);

/// User code serving requests.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve one request. The framework overwrites the response's `id` with
    /// the request's, so handlers need not (and cannot usefully) set it.
    async fn handle(&self, request: Value) -> Value;

    /// Classify a decoded non-ping message. Anything rejected here is
    /// dropped silently.
    fn is_request(&self, msg: &Value) -> bool {
        message::is_request(msg)
    }
}

/// How `listen()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// Won the election, served until the idle timeout or a shutdown signal.
    Closed,
    /// Deferred to a live peer; `ALREADY RUNNING` was written to stdout.
    AlreadyRunning,
}

/// Daemon server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service_name: String,
    /// Root for the coordination directory; defaults to the working directory.
    pub root: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub connection_timeout: Duration,
}

impl ServerConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            root: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

enum Election {
    Won(UnixListener),
    Deferred,
}

enum PeerStatus {
    Alive,
    Gone,
}

enum Handshake {
    /// The peer answered with the expected pong.
    Pong,
    /// The peer wrote bytes that are not the expected pong.
    Mismatch,
    /// Connect error, timeout, or the peer closed before answering.
    Unreachable,
}

pub struct DaemonServer<H> {
    paths: ServicePaths,
    config: ServerConfig,
    handler: Arc<H>,
    lock: StartingLock,
    /// This daemon's own script, learned from `SOCK_DAEMON_SCRIPT_<name>`.
    script_path: Option<PathBuf>,
    idle_deadline: Arc<Mutex<Instant>>,
    shutdown: Arc<Notify>,
}

impl<H: Handler> DaemonServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        let paths = match &config.root {
            Some(root) => ServicePaths::in_dir(root, &config.service_name)?,
            None => ServicePaths::from_cwd(&config.service_name)?,
        };
        let script_path = std::env::var_os(paths.script_env_var()).map(PathBuf::from);
        let lock = StartingLock::new(&paths);
        Ok(Self {
            paths,
            config,
            handler: Arc::new(handler),
            lock,
            script_path,
            idle_deadline: Arc::new(Mutex::new(Instant::now() + HERD_TIMEOUT)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Handle that makes a later `close()` reachable from other tasks.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    /// Run the election and, on winning it, serve until the idle timeout
    /// fires or a shutdown signal arrives.
    pub async fn listen(&mut self) -> Result<ListenOutcome> {
        std::fs::create_dir_all(self.paths.dir()).map_err(|e| {
            SockdError::io_error(
                format!(
                    "Failed to create daemon directory {}",
                    self.paths.dir().display()
                ),
                e,
            )
        })?;

        self.install_panic_cleanup();

        match self.elect().await? {
            Election::Deferred => Ok(ListenOutcome::AlreadyRunning),
            Election::Won(listener) => {
                self.serve(listener).await;
                self.close();
                Ok(ListenOutcome::Closed)
            }
        }
    }

    /// The singleton election.
    ///
    /// Cycles `acquire lock → bind → commit`; either contention point routes
    /// through a peer check that ends in deferring to a live daemon or
    /// evicting a dead one. A fresh lock held by a racing starter stays
    /// contended until the staleness window passes, so repeated Gone
    /// verdicts settle through the stale-takeover path.
    async fn elect(&mut self) -> Result<Election> {
        loop {
            // LOCK_PENDING
            if !self.lock.is_acquired() {
                match self.lock.acquire() {
                    Ok(()) => {}
                    Err(SockdError::LockContended { age_ms, .. }) => {
                        debug!(age_ms, "Starting lock contended, checking peer");
                        match self.await_peer(LOCK_PEER_BUDGET).await {
                            PeerStatus::Alive => return Ok(self.defer()),
                            PeerStatus::Gone => continue,
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            // LISTEN_PENDING — herd protection until the first real request
            self.idle_tick(Some(HERD_TIMEOUT));
            match UnixListener::bind(self.paths.socket_path()) {
                Ok(listener) => {
                    self.record_script_mtime();
                    self.lock.commit()?;
                    ready::announce(ready::READY);
                    info!(
                        socket = ?self.paths.socket_path(),
                        pid = std::process::id(),
                        "Daemon listening"
                    );
                    return Ok(Election::Won(listener));
                }
                Err(e) if endpoint_in_use(&e) => {
                    debug!(error = %e, "Endpoint in use, checking peer");
                    match self.await_peer(BIND_PEER_BUDGET).await {
                        PeerStatus::Alive => return Ok(self.defer()),
                        PeerStatus::Gone => {
                            self.evict_peer();
                            continue;
                        }
                    }
                }
                Err(e) => {
                    self.lock.release();
                    return Err(SockdError::bind_error(self.paths.socket_path(), e));
                }
            }
        }
    }

    fn defer(&mut self) -> Election {
        info!(service = self.paths.service_name(), "Deferring to live daemon");
        ready::announce(ready::ALREADY_RUNNING);
        self.lock.release();
        Election::Deferred
    }

    /// USURP: signal whatever the PID file names and clear the endpoint so
    /// the next bind attempt starts clean. Everything is best-effort; the
    /// recorded process may be long gone.
    fn evict_peer(&self) {
        if let Ok(contents) = std::fs::read_to_string(self.paths.pid_path()) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if process::is_alive(pid) {
                    info!(pid, "Usurping unresponsive daemon");
                    process::signal(pid, Signal::Terminate);
                } else {
                    debug!(pid, "Recorded daemon is already gone");
                }
            }
        }
        let _ = std::fs::remove_file(self.paths.socket_path());
        let _ = std::fs::remove_file(self.paths.pid_path());
    }

    /// AWAIT_PEER: keep pinging the endpoint until a valid pong (defer), a
    /// protocol mismatch (usurp), or an exhausted budget (usurp).
    async fn await_peer(&self, budget: Duration) -> PeerStatus {
        let deadline = Instant::now() + budget;
        let ping_id = format!(
            "{}-daemon-{}",
            self.paths.service_name(),
            std::process::id()
        );
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Peer check budget exhausted");
                return PeerStatus::Gone;
            }
            let attempt_budget = remaining.max(MIN_HANDSHAKE_TIMEOUT);
            match self.handshake_ping(&ping_id, attempt_budget).await {
                Handshake::Pong => return PeerStatus::Alive,
                Handshake::Mismatch => {
                    debug!("Peer answered with non-pong bytes");
                    return PeerStatus::Gone;
                }
                Handshake::Unreachable => {
                    // Retry while budget remains; pace instant connect
                    // failures so the loop is not a busy wait
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn handshake_ping(&self, ping_id: &str, budget: Duration) -> Handshake {
        match timeout(budget, self.handshake_attempt(ping_id)).await {
            Ok(outcome) => outcome,
            Err(_) => Handshake::Unreachable,
        }
    }

    async fn handshake_attempt(&self, ping_id: &str) -> Handshake {
        let Ok(stream) = UnixStream::connect(self.paths.socket_path()).await else {
            return Handshake::Unreachable;
        };
        let (read_half, mut write_half) = stream.into_split();

        let ping = message::ping(ping_id);
        let Ok(bytes) = frame::encode(&ping) else {
            return Handshake::Unreachable;
        };
        if write_half.write_all(&bytes).await.is_err() {
            return Handshake::Unreachable;
        }

        let mut reader = frame::reader(read_half);
        match frame::read_message(&mut reader).await {
            Some(Ok(msg)) if message::is_pong(&msg, Some(&ping)) => Handshake::Pong,
            Some(Ok(_)) => Handshake::Mismatch,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => Handshake::Mismatch,
            Some(Err(_)) | None => Handshake::Unreachable,
        }
    }

    /// Record the script mtime observed at startup so clients can detect a
    /// rebuilt script and replace this daemon.
    fn record_script_mtime(&self) {
        let Some(script) = &self.script_path else {
            return;
        };
        match script_mtime_ms(script) {
            Some(ms) => {
                if let Err(e) = std::fs::write(self.paths.mtime_path(), format!("{ms}\n")) {
                    warn!(error = %e, "Failed to record script mtime");
                }
            }
            None => warn!(script = ?script, "Failed to stat daemon script"),
        }
    }

    async fn serve(&self, listener: UnixListener) {
        let signal_task = spawn_signal_listener(Arc::clone(&self.shutdown));

        loop {
            let deadline = self.current_deadline();
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("Connection accepted");
                        let handler = Arc::clone(&self.handler);
                        let idle_deadline = Arc::clone(&self.idle_deadline);
                        let idle_timeout = self.config.idle_timeout;
                        let connection_timeout = self.config.connection_timeout;
                        tokio::spawn(run_connection(
                            stream,
                            handler,
                            idle_deadline,
                            idle_timeout,
                            connection_timeout,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
                () = sleep_until(deadline) => {
                    // A request may have pushed the deadline while we slept
                    if Instant::now() >= self.current_deadline() {
                        info!("Idle timeout reached, closing");
                        break;
                    }
                },
                () = self.shutdown.notified() => {
                    info!("Shutdown requested, closing");
                    break;
                }
            }
        }

        signal_task.abort();
    }

    fn current_deadline(&self) -> Instant {
        match self.idle_deadline.lock() {
            Ok(deadline) => *deadline,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Reset the server-wide idle timer; `None` restores the configured
    /// idle timeout.
    pub fn idle_tick(&self, after: Option<Duration>) {
        reset_deadline(
            &self.idle_deadline,
            after.unwrap_or(self.config.idle_timeout),
        );
    }

    /// Stop considering ourselves the live daemon: unlink the published pid
    /// and the endpoint so the next client spawns a replacement.
    fn close(&self) {
        let _ = std::fs::remove_file(self.paths.pid_path());
        let _ = std::fs::remove_file(self.paths.socket_path());
        info!("Daemon closed");
    }

    /// A panicking daemon must not leave a pid file or lock behind claiming
    /// the endpoint; mirror the signal-path cleanup in a panic hook.
    fn install_panic_cleanup(&self) {
        let socket_path = self.paths.socket_path();
        let pid_path = self.paths.pid_path();

        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = std::fs::remove_file(&socket_path);
            let _ = std::fs::remove_file(&pid_path);
            lock::release_all_held();
            warn!("Daemon panicked, cleaned up coordination files: {info}");
            default_hook(info);
        }));
    }
}

fn reset_deadline(deadline: &Mutex<Instant>, after: Duration) {
    let next = Instant::now() + after;
    match deadline.lock() {
        Ok(mut current) => *current = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn endpoint_in_use(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AlreadyExists
    )
}

fn script_mtime_ms(script: &Path) -> Option<u64> {
    let mtime = std::fs::metadata(script).and_then(|m| m.modified()).ok()?;
    let since_epoch = mtime.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}

/// Per-connection loop: decode frames, answer pings inline, dispatch
/// requests to the handler. Errors and receive-idle timeouts destroy the
/// connection silently.
async fn run_connection<H: Handler>(
    stream: UnixStream,
    handler: Arc<H>,
    idle_deadline: Arc<Mutex<Instant>>,
    idle_timeout: Duration,
    connection_timeout: Duration,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = frame::reader(read_half);

    loop {
        let next = if connection_timeout.is_zero() {
            frame::read_message(&mut reader).await
        } else {
            match timeout(connection_timeout, frame::read_message(&mut reader)).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("Connection receive-idle timeout");
                    return;
                }
            }
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "Connection read error");
                return;
            }
            None => {
                debug!("Connection closed by peer");
                return;
            }
        };

        if message::is_ping(&msg) {
            // Keep-alive only: answered inline, never counts as work for
            // the server-wide idle timer.
            let reply = message::pong(&msg, std::process::id());
            let Ok(bytes) = frame::encode(&reply) else {
                return;
            };
            if write_half.write_all(&bytes).await.is_err() {
                return;
            }
            continue;
        }

        if !handler.is_request(&msg) {
            debug!("Ignoring unrecognized message");
            continue;
        }

        reset_deadline(&idle_deadline, idle_timeout);

        let request_id = message::message_id(&msg).map(String::from);
        let result = handler.handle(msg).await;

        // The response id is always the request id, whatever the handler set
        let mut response = match result {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        if let Some(id) = request_id {
            response.insert("id".to_string(), Value::from(id));
        }

        let Ok(bytes) = frame::encode(&Value::Object(response)) else {
            return;
        };
        if write_half.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

fn spawn_signal_listener(shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) else {
                warn!("Failed to install signal handlers");
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => info!(signal = "SIGTERM", "Received SIGTERM"),
                _ = sigint.recv() => info!(signal = "SIGINT", "Received SIGINT"),
                _ = sighup.recv() => info!(signal = "SIGHUP", "Received SIGHUP"),
            }
        }

        #[cfg(windows)]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to install Ctrl+C handler");
                return;
            }
            info!(signal = "CTRL_C", "Received Ctrl+C");
        }

        // notify_one stores a permit, so a signal landing between select
        // iterations is not lost
        shutdown.notify_one();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoBack;

    #[async_trait]
    impl Handler for EchoBack {
        async fn handle(&self, request: Value) -> Value {
            json!({"echo": request, "id": "handler-set-this"})
        }
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("svc");
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert!(config.root.is_none());
    }

    #[test]
    fn test_endpoint_in_use_classification() {
        assert!(endpoint_in_use(&std::io::Error::from(
            std::io::ErrorKind::AddrInUse
        )));
        assert!(endpoint_in_use(&std::io::Error::from(
            std::io::ErrorKind::AlreadyExists
        )));
        assert!(!endpoint_in_use(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_default_request_predicate() {
        let handler = EchoBack;
        assert!(handler.is_request(&json!({"id": "1", "work": true})));
        assert!(!handler.is_request(&message::ping("1")));
        assert!(!handler.is_request(&json!({"no": "id"})));
    }

    #[tokio::test]
    async fn test_script_mtime_ms_of_missing_file() {
        assert!(script_mtime_ms(Path::new("/does/not/exist")).is_none());
    }
}
