//! One backend subprocess and its decoded message channel.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{BackendDefaults, BackendSpec};
use crate::protocol::framing::{write_message, MessageReader};
use crate::protocol::{JsonRpcMessage, MessageKind, RequestId, PROTOCOL_VERSION};

/// Variables copied from the gateway's environment into every backend.
pub const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Id of the gateway's own initialize request.
const HANDSHAKE_REQUEST_ID: u64 = 0;

/// The minimal environment every backend starts from.
pub fn default_environment() -> BTreeMap<String, String> {
    INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .filter(|(_, v)| !v.starts_with("()"))
        .collect()
}

/// Lifecycle state.
///
/// `Starting` until the initialize exchange completes, `Failed` when the
/// process goes away on its own, `Closed` once [`BackendSession::close`] ran.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting = 0,
    Ready = 1,
    Closed = 2,
    Failed = 3,
}

impl From<u8> for BackendState {
    fn from(val: u8) -> Self {
        match val {
            1 => BackendState::Ready,
            2 => BackendState::Closed,
            3 => BackendState::Failed,
            _ => BackendState::Starting,
        }
    }
}

impl BackendState {
    pub fn label(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Closed => "closed",
            BackendState::Failed => "failed",
        }
    }
}

/// Why a backend could not be brought up.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stdio pipes were not available for '{0}'")]
    Pipe(String),

    #[error("backend exited before completing the handshake ({0})")]
    ExitedEarly(String),

    #[error("backend rejected initialize: {0}")]
    Rejected(String),

    #[error("backend did not answer initialize within {0:?}")]
    HandshakeTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{0}' is closed")]
    Closed(String),
}

/// Knobs for spawning and closing.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub channel_capacity: usize,
}

impl From<&BackendDefaults> for SpawnOptions {
    fn from(cfg: &BackendDefaults) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            channel_capacity: cfg.channel_capacity.max(1),
        }
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::from(&BackendDefaults::default())
    }
}

/// The far side of an in-process backend created with [`BackendSession::from_channel`].
pub struct ChannelPeer {
    /// Messages the gateway wrote to the backend.
    pub from_gateway: mpsc::Receiver<JsonRpcMessage>,
    /// Send here to deliver messages to the gateway.
    pub to_gateway: mpsc::Sender<JsonRpcMessage>,
}

/// A running backend.
///
/// Owns the child process (if any), the writer half feeding its stdin and
/// the reader half decoding its stdout.
pub struct BackendSession {
    spec: BackendSpec,
    state: Arc<AtomicU8>,
    pid: Option<u32>,
    initialize_result: Value,
    shutdown_grace: Duration,
    outgoing: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    incoming: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BackendSession {
    /// Spawn the process, start its I/O tasks and run the initialize exchange.
    pub async fn spawn(spec: BackendSpec, opts: &SpawnOptions) -> Result<Arc<Self>, SpawnError> {
        let label = spec.label().to_string();
        tracing::info!(
            backend = %label,
            command = %spec.command_line(),
            cwd = ?spec.cwd,
            "Spawning backend"
        );

        let mut child = build_command(&spec).spawn().map_err(|source| SpawnError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(SpawnError::Pipe(label));
        };

        let state = Arc::new(AtomicU8::new(BackendState::Starting as u8));
        let (out_tx, out_rx) = mpsc::channel(opts.channel_capacity);
        let (in_tx, mut in_rx) = mpsc::channel(opts.channel_capacity);
        let writer = tokio::spawn(write_loop(stdin, out_rx, label.clone()));
        let reader = tokio::spawn(read_loop(stdout, in_tx, label.clone(), Arc::clone(&state)));

        let outcome = tokio::time::timeout(
            opts.handshake_timeout,
            handshake(&out_tx, &mut in_rx, &label),
        )
        .await;

        let initialize_result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(failure)) => {
                let err = match failure {
                    HandshakeFailure::Rejected(msg) => SpawnError::Rejected(msg),
                    HandshakeFailure::ChannelClosed => {
                        let status = match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                            Ok(Ok(status)) => status.to_string(),
                            Ok(Err(e)) => e.to_string(),
                            Err(_) => "stdout closed".to_string(),
                        };
                        SpawnError::ExitedEarly(status)
                    }
                };
                abandon(child, writer, reader).await;
                return Err(err);
            }
            Err(_) => {
                abandon(child, writer, reader).await;
                return Err(SpawnError::HandshakeTimeout(opts.handshake_timeout));
            }
        };

        state.store(BackendState::Ready as u8, Ordering::Release);
        tracing::info!(
            backend = %label,
            pid = ?pid,
            server = %describe_server(&initialize_result),
            "Backend ready"
        );

        Ok(Arc::new(Self {
            spec,
            state,
            pid,
            initialize_result,
            shutdown_grace: opts.shutdown_grace,
            outgoing: Mutex::new(Some(out_tx)),
            incoming: Mutex::new(Some(in_rx)),
            child: tokio::sync::Mutex::new(Some(child)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Attach to an in-process message channel instead of a subprocess.
    ///
    /// The session is `Ready` immediately with the given initialize result.
    pub fn from_channel(
        spec: BackendSpec,
        initialize_result: Value,
        capacity: usize,
    ) -> (Arc<Self>, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            spec,
            state: Arc::new(AtomicU8::new(BackendState::Ready as u8)),
            pid: None,
            initialize_result,
            shutdown_grace: Duration::ZERO,
            outgoing: Mutex::new(Some(out_tx)),
            incoming: Mutex::new(Some(in_rx)),
            child: tokio::sync::Mutex::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        });
        let peer = ChannelPeer {
            from_gateway: out_rx,
            to_gateway: in_tx,
        };
        (session, peer)
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        self.spec.label()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        BackendState::from(self.state.load(Ordering::Acquire))
    }

    /// Result of the backend's initialize response.
    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    /// Take the decoded stdout channel. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<JsonRpcMessage>> {
        lock(&self.incoming).take()
    }

    /// Queue a message for the backend's stdin.
    pub async fn send(&self, msg: JsonRpcMessage) -> Result<(), BackendError> {
        let tx = lock(&self.outgoing)
            .clone()
            .ok_or_else(|| BackendError::Closed(self.label().to_string()))?;
        tx.send(msg)
            .await
            .map_err(|_| BackendError::Closed(self.label().to_string()))
    }

    /// Terminate the process and release both channel halves.
    ///
    /// Safe to call more than once and after the process already died.
    pub async fn close(&self) {
        let prev = BackendState::from(self.state.swap(BackendState::Closed as u8, Ordering::AcqRel));
        if prev == BackendState::Closed {
            return;
        }

        drop(lock(&self.outgoing).take());
        drop(lock(&self.incoming).take());
        // Dropping the writer drops ChildStdin, which is the backend's cue to exit.
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(backend = %self.label(), status = %status, "Backend exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.label(), error = %e, "Failed to wait for backend");
                    let _ = child.kill().await;
                }
                Err(_) => {
                    tracing::warn!(
                        backend = %self.label(),
                        grace = ?self.shutdown_grace,
                        "Backend did not exit in time; killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::error!(backend = %self.label(), error = %e, "Failed to kill backend");
                    }
                }
            }
        }

        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        tracing::debug!(backend = %self.label(), "Backend session closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn build_command(spec: &BackendSpec) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .env_clear()
        .envs(default_environment())
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

enum HandshakeFailure {
    ChannelClosed,
    Rejected(String),
}

async fn handshake(
    out: &mpsc::Sender<JsonRpcMessage>,
    incoming: &mut mpsc::Receiver<JsonRpcMessage>,
    label: &str,
) -> Result<Value, HandshakeFailure> {
    let init = JsonRpcMessage::request(
        RequestId::from(HANDSHAKE_REQUEST_ID),
        "initialize",
        Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
    );
    out.send(init).await.map_err(|_| HandshakeFailure::ChannelClosed)?;

    let expected = RequestId::from(HANDSHAKE_REQUEST_ID);
    let result = loop {
        let msg = incoming.recv().await.ok_or(HandshakeFailure::ChannelClosed)?;
        if msg.kind() != MessageKind::Response || msg.id().as_ref() != Some(&expected) {
            tracing::debug!(backend = %label, method = ?msg.method(), "Ignoring message before initialize response");
            continue;
        }
        if let Some(result) = msg.result() {
            break result.clone();
        }
        let reason = msg
            .error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "malformed response".to_string());
        return Err(HandshakeFailure::Rejected(reason));
    };

    out.send(JsonRpcMessage::notification("notifications/initialized", None))
        .await
        .map_err(|_| HandshakeFailure::ChannelClosed)?;
    Ok(result)
}

fn describe_server(result: &Value) -> String {
    let info = &result["serverInfo"];
    match (info["name"].as_str(), info["version"].as_str()) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name.to_string(),
        _ => "unknown".to_string(),
    }
}

async fn abandon(mut child: Child, writer: JoinHandle<()>, reader: JoinHandle<()>) {
    writer.abort();
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Kill after failed handshake");
    }
    reader.abort();
}

async fn write_loop<W>(mut stdin: W, mut rx: mpsc::Receiver<JsonRpcMessage>, label: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut stdin, &msg).await {
            tracing::warn!(backend = %label, error = %e, "Failed to write to backend stdin");
            break;
        }
    }
    tracing::debug!(backend = %label, "Backend writer stopped");
}

async fn read_loop<R>(stdout: R, tx: mpsc::Sender<JsonRpcMessage>, label: String, state: Arc<AtomicU8>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(stdout, label.clone());
    loop {
        match reader.next_message().await {
            Ok(Some(msg)) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(backend = %label, "Backend stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(backend = %label, error = %e, "Error reading backend stdout");
                break;
            }
        }
    }

    let failed = state.compare_exchange(
        BackendState::Ready as u8,
        BackendState::Failed as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if failed.is_ok() {
        tracing::error!(backend = %label, "Backend went away while serving");
    }
}
