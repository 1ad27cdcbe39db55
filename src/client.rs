//! The client side: locate the daemon, connect with retry, spawn one if the
//! endpoint is missing, health-check it, and replay outstanding requests
//! across reconnects.
//!
//! A request survives any number of mid-flight disconnects: it stays in the
//! outstanding map until a response with its id arrives or it is cancelled,
//! and every freshly established connection rewrites the whole map. The
//! daemon may therefore see the same request more than once; responses are
//! matched by unique id and duplicates for an already-resolved id are
//! dropped.

use crate::error::{Result, SockdError};
use crate::frame;
use crate::message;
use crate::paths::{DEBUG_ENV_VAR, DEBUG_ENV_VALUE, ServicePaths};
use crate::process::{self, Signal};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long a freshly connected client waits for its handshake pong before
/// presuming the peer is wedged.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause between the graceful and forceful kill signals.
const KILL_SIGNAL_PAUSE: Duration = Duration::from_millis(50);

/// Daemon client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_name: String,
    /// Root for the coordination directory; defaults to the working directory.
    pub root: Option<PathBuf>,
    /// The daemon program this client spawns and watches for rebuilds.
    pub daemon_script: PathBuf,
    /// Interpreter to run the script with. When unset, the script itself is
    /// executed.
    pub spawn_program: Option<PathBuf>,
    /// Arguments placed before the script path (interpreter flags), or
    /// passed to the script directly when no interpreter is configured.
    pub exec_argv: Vec<String>,
    /// Inject the verbose-logging selector into the spawned daemon's env.
    pub debug: bool,
    /// Classifier for incoming non-pong messages; the default accepts any
    /// object carrying a string `id`.
    pub is_response: fn(&Value) -> bool,
}

impl ClientConfig {
    pub fn new(service_name: impl Into<String>, daemon_script: impl Into<PathBuf>) -> Self {
        Self {
            service_name: service_name.into(),
            root: None,
            daemon_script: daemon_script.into(),
            spawn_program: None,
            exec_argv: Vec::new(),
            debug: false,
            is_response: message::is_response,
        }
    }
}

struct Pending {
    /// Full framed payload, rewritten on every reconnect.
    payload: Value,
    tx: Option<oneshot::Sender<Result<Value>>>,
}

struct ConnState {
    /// Bumped on every connect and disconnect; event handlers compare it
    /// before mutating shared state, because a retry may have installed a
    /// newer connection underneath them.
    generation: u64,
    connected: bool,
    connecting: bool,
    /// Whether any connection in this client's lifetime completed the
    /// handshake.
    pinged: bool,
    /// The in-flight handshake ping awaiting its pong.
    handshake: Option<Value>,
    /// Queue feeding the current connection's writer task. Enqueueing never
    /// suspends, so frames can be queued from inside the outstanding-map
    /// critical section; the task owns the socket half and does the actual
    /// writes.
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    outstanding: HashMap<String, Pending>,
}

struct ClientInner {
    paths: ServicePaths,
    config: ClientConfig,
    /// `"<pid>-<clientSeq>"`, unique per client instance in this process.
    client_id: String,
    /// One counter for handshake pings and requests alike, so their ids
    /// (`"<clientId>-<seq>"`) can never collide.
    msg_seq: AtomicU64,
    state: Mutex<ConnState>,
    /// Serializes script-mtime checks so racing requests trigger at most
    /// one restart.
    mtime_gate: Mutex<()>,
}

/// A pending request: await it for the response, or cancel the wait.
pub struct RequestHandle {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
    inner: Arc<ClientInner>,
}

impl RequestHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve with the matching response, or the cancellation reason.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SockdError::cancelled("client dropped")),
        }
    }

    /// Abort the wait, not the work: the request leaves the outstanding map
    /// and any late response for it is dropped silently. The connection
    /// stays up.
    pub async fn cancel(&self, reason: &str) {
        self.inner
            .reject(&self.id, SockdError::cancelled(reason))
            .await;
    }
}

pub struct DaemonClient {
    inner: Arc<ClientInner>,
}

impl DaemonClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

        let paths = match &config.root {
            Some(root) => ServicePaths::in_dir(root, &config.service_name)?,
            None => ServicePaths::from_cwd(&config.service_name)?,
        };
        if config.daemon_script.as_os_str().is_empty() {
            return Err(SockdError::config_error("daemon script must not be empty"));
        }
        let client_id = format!(
            "{}-{}",
            std::process::id(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                paths,
                config,
                client_id,
                msg_seq: AtomicU64::new(0),
                state: Mutex::new(ConnState {
                    generation: 0,
                    connected: false,
                    connecting: false,
                    pinged: false,
                    handshake: None,
                    writer: None,
                    outstanding: HashMap::new(),
                }),
                mtime_gate: Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn paths(&self) -> &ServicePaths {
        &self.inner.paths
    }

    /// Send a request to the daemon, spawning one if necessary.
    ///
    /// The payload is copied with its `id` overridden by a fresh unique id.
    /// The returned handle resolves with the matching response.
    pub async fn request(&self, payload: Value) -> RequestHandle {
        let id = format!(
            "{}-{}",
            self.inner.client_id,
            self.inner.msg_seq.fetch_add(1, Ordering::Relaxed)
        );

        let mut fields = match payload {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        fields.insert("id".to_string(), Value::from(id.clone()));
        let msg = Value::Object(fields);

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            state.outstanding.insert(
                id.clone(),
                Pending {
                    payload: msg,
                    tx: Some(tx),
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        let request_id = id.clone();
        tokio::spawn(async move {
            inner.drive_request(&request_id).await;
        });

        RequestHandle {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Health-check the daemon: a request whose payload is a ping. Resolves
    /// to the pong with the round-trip time attached as `duration`.
    pub async fn ping(&self) -> Result<Value> {
        // request() overrides the id; the ping shape stays intact
        self.request(message::ping("")).await.wait().await
    }

    /// Read the PID file and gracefully stop the daemon it names. Missing
    /// or malformed PID files make this a no-op.
    pub async fn kill(&self) {
        self.inner.kill_daemon().await;
    }

    /// Drop the current connection, if any. Outstanding requests stay
    /// registered and replay on the next connect.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        ClientInner::disconnect_locked(&mut state);
    }

    /// Reject every outstanding request with a cancellation error.
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        for (_, mut pending) in state.outstanding.drain() {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Err(SockdError::cancelled("cleared")));
            }
        }
    }

    /// Compare the recorded script mtime with the script on disk; on
    /// mismatch, remove the record and kill the daemon so the next request
    /// spawns a fresh one. Returns whether a restart was triggered.
    pub async fn check_script_mtime(&self) -> bool {
        self.inner.check_script_mtime().await
    }
}

impl ClientInner {
    async fn drive_request(self: Arc<Self>, id: &str) {
        self.check_script_mtime().await;

        let mut state = self.state.lock().await;
        if !state.outstanding.contains_key(id) {
            // cancelled (or resolved) before we got here
            return;
        }
        if state.connected {
            let bytes = state
                .outstanding
                .get(id)
                .and_then(|pending| frame::encode(&pending.payload).ok());
            if let (Some(bytes), Some(writer)) = (bytes, state.writer.as_ref()) {
                if writer.send(bytes).is_err() {
                    debug!("Write queue closed on live connection; dropping it");
                    Self::disconnect_locked(&mut state);
                }
            }
            return;
        }
        if state.connecting {
            // the in-flight connect replays the whole map on success
            return;
        }
        state.connecting = true;
        drop(state);

        self.connect().await;
    }

    async fn connect(self: Arc<Self>) {
        let _ = tokio::fs::create_dir_all(self.paths.dir()).await;
        self.connect_loop().await;
    }

    /// Keep trying the endpoint; a missing endpoint means no daemon, so
    /// spawn one and retry once it signals readiness on stdout.
    async fn connect_loop(self: Arc<Self>) {
        loop {
            match UnixStream::connect(self.paths.socket_path()).await {
                Ok(stream) => {
                    self.on_connected(stream).await;
                    return;
                }
                Err(e) if endpoint_missing(&e) => {
                    debug!(error = %e, "Endpoint missing, spawning daemon");
                    if !self.spawn_daemon().await {
                        // Spawn failures are never surfaced; requests wait
                        // for the caller's own timeout
                        self.state.lock().await.connecting = false;
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Connect failed");
                    self.state.lock().await.connecting = false;
                    return;
                }
            }
        }
    }

    fn on_connected(
        self: Arc<Self>,
        stream: UnixStream,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.on_connected_inner(stream))
    }

    async fn on_connected_inner(self: Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        // One atomic critical section: flip the flags and queue the
        // handshake ping (once per client lifetime) followed by the replay,
        // in that textual order. Enqueueing never suspends; the writer task
        // drains the queue onto the socket.
        let mut state = self.state.lock().await;
        state.generation += 1;
        let generation = state.generation;
        state.connected = true;
        state.connecting = false;

        let mut handshake_armed = false;
        if !state.pinged {
            let ping_id = format!(
                "{}-{}",
                self.client_id,
                self.msg_seq.fetch_add(1, Ordering::Relaxed)
            );
            let ping = message::ping(&ping_id);
            if let Ok(bytes) = frame::encode(&ping) {
                if tx.send(bytes).is_ok() {
                    state.handshake = Some(ping);
                    handshake_armed = true;
                }
            }
        }

        let mut replayed = 0;
        for pending in state.outstanding.values() {
            if let Ok(bytes) = frame::encode(&pending.payload) {
                let _ = tx.send(bytes);
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!(count = replayed, "Replayed outstanding requests");
        }

        state.writer = Some(tx);
        drop(state);

        let writer_inner = Arc::clone(&self);
        tokio::spawn(async move {
            writer_inner.write_loop(write_half, rx, generation).await;
        });

        let reader_inner = Arc::clone(&self);
        tokio::spawn(async move {
            reader_inner.read_loop(read_half, generation).await;
        });

        if handshake_armed {
            let timer_inner = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
                timer_inner.handshake_expired(generation).await;
            });
        }
    }

    /// Drain queued frames onto the socket. Ends when the queue closes (a
    /// disconnect dropped the sender) or a write fails; only the latter
    /// tears the connection down.
    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        generation: u64,
    ) {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                let mut state = self.state.lock().await;
                if state.generation == generation {
                    debug!("Write failed on live connection; dropping it");
                    Self::disconnect_locked(&mut state);
                }
                return;
            }
        }
    }

    /// The handshake pong never came: the peer holds the endpoint open but
    /// is not a functioning daemon. Treat it exactly like a missing
    /// endpoint — spawn a replacement (whose own election will evict the
    /// wedged process) and reconnect.
    async fn handshake_expired(self: Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.pinged {
                return;
            }
            info!("Handshake ping timed out; daemon presumed wedged");
            Self::disconnect_locked(&mut state);
            state.connecting = true;
        }
        self.connect_loop_after_spawn().await;
    }

    async fn connect_loop_after_spawn(self: Arc<Self>) {
        if self.spawn_daemon().await {
            self.connect_loop().await;
        } else {
            self.state.lock().await.connecting = false;
        }
    }

    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf, generation: u64) {
        let mut reader = frame::reader(read_half);
        loop {
            match frame::read_message(&mut reader).await {
                Some(Ok(msg)) => self.on_message(generation, msg).await,
                Some(Err(e)) => {
                    debug!(error = %e, "Connection read error");
                    break;
                }
                None => {
                    debug!("Connection closed");
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.generation == generation {
            Self::disconnect_locked(&mut state);
        }
    }

    async fn on_message(&self, generation: u64, msg: Value) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            // a retry installed a newer connection; this one no longer
            // speaks for the client
            return;
        }

        if let Some(handshake) = &state.handshake {
            if message::is_pong(&msg, Some(handshake)) {
                debug!("Handshake pong received");
                state.pinged = true;
                state.handshake = None;
            }
        }

        let is_pong = message::is_pong(&msg, None);
        if !is_pong && !(self.config.is_response)(&msg) {
            return;
        }
        let Some(id) = message::message_id(&msg) else {
            return;
        };
        if let Some(mut pending) = state.outstanding.remove(id) {
            let mut value = msg.clone();
            if is_pong {
                message::attach_duration(&mut value);
            }
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Ok(value));
            }
        }
    }

    async fn reject(&self, id: &str, err: SockdError) {
        let mut state = self.state.lock().await;
        if let Some(mut pending) = state.outstanding.remove(id) {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn disconnect_locked(state: &mut ConnState) {
        state.connected = false;
        state.connecting = false;
        state.handshake = None;
        // dropping the queue sender ends the connection's writer task
        state.writer = None;
        // stale reader tasks and handshake timers compare generations and
        // stand down
        state.generation += 1;
    }

    async fn check_script_mtime(&self) -> bool {
        let _gate = self.mtime_gate.lock().await;

        let Ok(recorded) = tokio::fs::read_to_string(self.paths.mtime_path()).await else {
            return false;
        };
        let Some(current) = script_mtime_ms(&self.config.daemon_script) else {
            return false;
        };
        if recorded.trim().parse::<u64>() == Ok(current) {
            return false;
        }

        info!(
            script = ?self.config.daemon_script,
            "Daemon script changed since the daemon started; replacing it"
        );
        let _ = tokio::fs::remove_file(self.paths.mtime_path()).await;
        self.kill_daemon().await;
        true
    }

    async fn kill_daemon(&self) {
        let Ok(contents) = std::fs::read_to_string(self.paths.pid_path()) else {
            return;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return;
        };
        {
            let mut state = self.state.lock().await;
            Self::disconnect_locked(&mut state);
        }
        info!(pid, "Stopping daemon");
        #[cfg(unix)]
        {
            process::signal(pid, Signal::Hangup);
            tokio::time::sleep(KILL_SIGNAL_PAUSE).await;
            process::signal(pid, Signal::Terminate);
        }
        #[cfg(windows)]
        {
            process::signal(pid, Signal::Terminate);
        }
    }

    /// Launch the daemon detached, stderr appended to the service log, and
    /// wait for the first stdout byte: the signal that it is either
    /// accepting connections or deferring to a peer that is.
    async fn spawn_daemon(&self) -> bool {
        let script = &self.config.daemon_script;
        let mut cmd = match &self.config.spawn_program {
            Some(program) => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(&self.config.exec_argv).arg(script);
                cmd
            }
            None => {
                let mut cmd = tokio::process::Command::new(script);
                cmd.args(&self.config.exec_argv);
                cmd
            }
        };

        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.log_path())
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());

        cmd.env(self.paths.script_env_var(), script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr);
        if self.config.debug {
            cmd.env(DEBUG_ENV_VAR, DEBUG_ENV_VALUE);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, script = ?script, "Failed to spawn daemon");
                return false;
            }
        };
        let Some(mut stdout) = child.stdout.take() else {
            return false;
        };

        // One byte is the whole readiness protocol; the content is for
        // humans. The pipe is dropped right after, detaching the child.
        let mut byte = [0u8; 1];
        match stdout.read(&mut byte).await {
            Ok(n) if n > 0 => {
                debug!("Daemon signalled readiness on stdout");
                true
            }
            _ => {
                debug!("Daemon exited without signalling readiness");
                false
            }
        }
    }
}

fn endpoint_missing(e: &std::io::Error) -> bool {
    // ENOENT: no daemon ever bound here. ECONNREFUSED: a daemon bound here
    // and died without cleanup; nobody is coming back for that socket.
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

fn script_mtime_ms(script: &Path) -> Option<u64> {
    let mtime = std::fs::metadata(script).and_then(|m| m.modified()).ok()?;
    let since_epoch = mtime.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn client_in(dir: &TempDir) -> DaemonClient {
        let mut config = ClientConfig::new("clienttest", "/bin/false");
        config.root = Some(dir.path().to_path_buf());
        DaemonClient::new(config).unwrap()
    }

    #[test]
    fn test_empty_script_rejected() {
        let config = ClientConfig::new("svc", "");
        assert!(DaemonClient::new(config).is_err());
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_and_structured() {
        let temp_dir = TempDir::new().unwrap();
        let client = client_in(&temp_dir);

        let a = client.request(json!({"work": 1})).await;
        let b = client.request(json!({"work": 2})).await;
        assert_ne!(a.id(), b.id());

        // "<pid>-<clientSeq>-<reqSeq>"
        let parts: Vec<&str> = a.id().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_cancel_rejects_with_reason() {
        let temp_dir = TempDir::new().unwrap();
        let client = client_in(&temp_dir);

        let handle = client.request(json!({"work": true})).await;
        handle.cancel("caller gave up").await;

        let err = handle.wait().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("caller gave up"));
    }

    #[tokio::test]
    async fn test_clear_rejects_everything_outstanding() {
        let temp_dir = TempDir::new().unwrap();
        let client = client_in(&temp_dir);

        let a = client.request(json!({"n": 1})).await;
        let b = client.request(json!({"n": 2})).await;
        client.clear().await;

        assert!(a.wait().await.unwrap_err().is_cancelled());
        assert!(b.wait().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_kill_without_pid_file_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let client = client_in(&temp_dir);
        client.kill().await;
    }

    #[tokio::test]
    async fn test_mtime_check_without_record_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let client = client_in(&temp_dir);
        assert!(!client.check_script_mtime().await);
    }

    #[test]
    fn test_endpoint_missing_classification() {
        assert!(endpoint_missing(&std::io::Error::from(
            std::io::ErrorKind::NotFound
        )));
        assert!(endpoint_missing(&std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused
        )));
        assert!(!endpoint_missing(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }
}


