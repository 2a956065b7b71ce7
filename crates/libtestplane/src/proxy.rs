//! Controller-side handles to test host processes.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use testplane_protocol::{
    HIGHEST_SUPPORTED_VERSION, Message, MessageType, deserialize, deserialize_payload, serialize,
    serialize_empty,
};

use crate::channel::{ChannelListener, ChannelReceiver, ChannelSender, Endpoint, MessageChannel};
use crate::config::TestplaneConfig;
use crate::error::{ChannelError, ProxyError};

/// How long a closing host gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// One pooled connection to a test host.
pub trait TestHostProxy: Send + Sync + 'static {
    /// Start (or attach to) a host and complete the version handshake.
    ///
    /// `Ok(false)` is an expected setup failure. `Err` is anything else.
    fn setup_channel(
        &self,
        sources: &[String],
        run_settings: &str,
    ) -> impl Future<Output = Result<bool, ProxyError>> + Send;

    /// Tear down the connection and any process behind it. Idempotent, and
    /// safe to call when setup never happened.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Starts a test host that will dial `endpoint`.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, endpoint: &Endpoint) -> Result<Child, ProxyError>;
}

/// Runs the `testplane-host` executable.
#[derive(Debug, Clone)]
pub struct HostProcessLauncher {
    executable: PathBuf,
    args: Vec<String>,
}

impl HostProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments passed after `--endpoint`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }
}

impl WorkerLauncher for HostProcessLauncher {
    fn launch(&self, endpoint: &Endpoint) -> Result<Child, ProxyError> {
        Command::new(&self.executable)
            .arg("--endpoint")
            .arg(endpoint.to_string())
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProxyError::Launch)
    }
}

struct Connection {
    sender: ChannelSender,
    receiver: ChannelReceiver,
    version: u32,
}

enum Rendezvous {
    Accepted(Result<MessageChannel, ChannelError>),
    Exited(std::io::Result<ExitStatus>),
}

/// A test host process reached over a private Unix socket.
pub struct ProcessProxy {
    launcher: Arc<dyn WorkerLauncher>,
    socket_dir: PathBuf,
    connection_timeout: Duration,
    handshake_timeout: Duration,
    version: AtomicU32,
    sender: Mutex<Option<ChannelSender>>,
    receiver: tokio::sync::Mutex<Option<ChannelReceiver>>,
    child: tokio::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl ProcessProxy {
    pub fn new(config: &TestplaneConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            socket_dir: config.runtime_dir.clone(),
            connection_timeout: config.connection_timeout(),
            handshake_timeout: config.handshake_timeout(),
            version: AtomicU32::new(0),
            sender: Mutex::new(None),
            receiver: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Negotiated version, 0 until setup succeeds.
    pub fn protocol_version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    pub fn send<T: Serialize>(&self, kind: MessageType, payload: &T) -> Result<(), ProxyError> {
        let frame = serialize(kind, payload, self.protocol_version())?;
        self.sender()?.send(frame)?;
        Ok(())
    }

    pub fn send_empty(&self, kind: MessageType) -> Result<(), ProxyError> {
        let frame = serialize_empty(kind, self.protocol_version())?;
        self.sender()?.send(frame)?;
        Ok(())
    }

    /// Next message from the host, `None` once it hangs up.
    pub async fn recv(&self) -> Result<Option<Message>, ProxyError> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(ProxyError::NotConnected)?;
        match receiver.recv().await {
            Some(frame) => Ok(Some(deserialize(&frame?)?)),
            None => Ok(None),
        }
    }

    fn sender(&self) -> Result<ChannelSender, ProxyError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProxyError::NotConnected)
    }

    async fn establish(
        &self,
        listener: &ChannelListener,
        child: &mut Child,
    ) -> Result<Option<Connection>, ProxyError> {
        let rendezvous = tokio::select! {
            accepted = listener.accept(self.connection_timeout) => Rendezvous::Accepted(accepted),
            status = child.wait() => Rendezvous::Exited(status),
        };

        let channel = match rendezvous {
            Rendezvous::Accepted(Ok(channel)) => channel,
            Rendezvous::Accepted(Err(ChannelError::Timeout(timeout))) => {
                warn!(?timeout, "test host did not connect in time");
                return Ok(None);
            }
            Rendezvous::Accepted(Err(e)) => return Err(e.into()),
            Rendezvous::Exited(status) => {
                warn!(?status, "test host exited before connecting");
                return Ok(None);
            }
        };

        let (sender, mut receiver) = channel.split();
        // Proposal goes out in the pre-negotiation envelope.
        sender.send(serialize(
            MessageType::VersionCheck,
            &HIGHEST_SUPPORTED_VERSION,
            0,
        )?)?;

        let frame = match tokio::time::timeout(self.handshake_timeout, receiver.recv()).await {
            Err(_) => {
                warn!(timeout = ?self.handshake_timeout, "no version check reply from test host");
                return Ok(None);
            }
            Ok(None) => {
                warn!("test host hung up during version check");
                return Ok(None);
            }
            Ok(Some(frame)) => frame?,
        };

        let reply = deserialize(&frame)
            .map_err(|e| ProxyError::Protocol(format!("malformed version check reply: {e}")))?;
        if !reply.is(MessageType::VersionCheck) {
            return Err(ProxyError::Protocol(format!(
                "expected {} during handshake, got {}",
                MessageType::VersionCheck,
                reply.message_type
            )));
        }
        let version: u32 = deserialize_payload(&reply)
            .map_err(|e| ProxyError::Protocol(format!("malformed version check reply: {e}")))?;
        if version == 0 || version > HIGHEST_SUPPORTED_VERSION {
            return Err(ProxyError::Protocol(format!(
                "test host chose unsupported protocol version {version}"
            )));
        }

        Ok(Some(Connection {
            sender,
            receiver,
            version,
        }))
    }
}

impl TestHostProxy for ProcessProxy {
    async fn setup_channel(&self, sources: &[String], run_settings: &str) -> Result<bool, ProxyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::NotConnected);
        }

        let endpoint = Endpoint::Unix(
            self.socket_dir
                .join(format!("host-{}.sock", Uuid::new_v4().simple())),
        );
        let listener = ChannelListener::bind(&endpoint).await?;
        let mut child = self.launcher.launch(listener.endpoint())?;
        debug!(
            pid = child.id(),
            endpoint = %endpoint,
            sources = sources.len(),
            settings_bytes = run_settings.len(),
            "test host launched"
        );

        match self.establish(&listener, &mut child).await {
            Ok(Some(connection)) => {
                self.version.store(connection.version, Ordering::SeqCst);
                *self.sender.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(connection.sender);
                *self.receiver.lock().await = Some(connection.receiver);
                info!(pid = child.id(), version = connection.version, "test host ready");
                *self.child.lock().await = Some(child);
                Ok(true)
            }
            Ok(None) => {
                let _ = child.kill().await;
                Ok(false)
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            match serialize_empty(MessageType::SessionEnd, self.protocol_version()) {
                Ok(frame) => {
                    if let Err(e) = sender.send(frame) {
                        debug!(error = %e, "could not send session end");
                    }
                }
                Err(e) => warn!(error = %e, "could not encode session end"),
            }
            sender.close();
        }
        self.receiver.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "test host exited"),
                Ok(Err(e)) => warn!(error = %e, "failed to reap test host"),
                Err(_) => {
                    warn!(pid = child.id(), "test host did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}
