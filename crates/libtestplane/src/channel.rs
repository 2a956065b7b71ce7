//! Length-delimited duplex transport between a controller and a test host.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use testplane_protocol::MAX_FRAME_BYTES;

use crate::error::ChannelError;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Address of one side of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = ChannelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Some(path) = raw.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ChannelError::InvalidEndpoint(raw.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = raw.strip_prefix("tcp:") {
            return addr
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| ChannelError::InvalidEndpoint(raw.to_string()));
        }
        Err(ChannelError::InvalidEndpoint(raw.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Which side dials: the client connects, the host listens for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Host,
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Establish a channel in the given role.
pub async fn open(
    endpoint: &Endpoint,
    role: ConnectionRole,
    timeout: Duration,
) -> Result<MessageChannel, ChannelError> {
    match role {
        ConnectionRole::Client => MessageChannel::connect(endpoint, timeout).await,
        ConnectionRole::Host => {
            let listener = ChannelListener::bind(endpoint).await?;
            listener.accept(timeout).await
        }
    }
}

/// Cloneable, non-blocking send half. Safe to use from blocking threads.
#[derive(Clone)]
pub struct ChannelSender {
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

impl ChannelSender {
    /// Queue one frame for the writer task.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(Bytes::from(frame))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct ChannelReceiver {
    frames: FramedRead<BoxedReader, LengthDelimitedCodec>,
    closed: CancellationToken,
}

impl ChannelReceiver {
    /// Next inbound frame. `None` once the peer hangs up or the channel is closed.
    pub async fn recv(&mut self) -> Option<Result<BytesMut, ChannelError>> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            frame = self.frames.next() => frame.map(|r| r.map_err(ChannelError::from)),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// A connected channel, split into its halves by [`MessageChannel::split`].
pub struct MessageChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl MessageChannel {
    /// Wrap any duplex byte stream. Must be called inside a tokio runtime.
    pub fn new<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let closed = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, frame_codec()),
            rx,
            closed.clone(),
        ));

        let reader: BoxedReader = Box::pin(read_half);
        Self {
            sender: ChannelSender {
                outbound,
                closed: closed.clone(),
            },
            receiver: ChannelReceiver {
                frames: FramedRead::new(reader, frame_codec()),
                closed,
            },
        }
    }

    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, ChannelError> {
        let attempt = async {
            match endpoint {
                Endpoint::Unix(path) => UnixStream::connect(path).await.map(Self::new),
                Endpoint::Tcp(addr) => TcpStream::connect(addr).await.map(|stream| {
                    let _ = stream.set_nodelay(true);
                    Self::new(stream)
                }),
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(channel)) => {
                debug!(endpoint = %endpoint, "channel connected");
                Ok(channel)
            }
            Ok(Err(source)) => Err(ChannelError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.sender.send(frame)
    }

    pub async fn recv(&mut self) -> Option<Result<BytesMut, ChannelError>> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    /// Idempotent. Frames queued before the call are still flushed.
    pub fn close(&self) {
        self.sender.close();
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(error = %e, "channel write failed");
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!(error = %e, "channel close failed");
    }
    closed.cancel();
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Accepts the single peer of a host-role channel.
pub struct ChannelListener {
    inner: ListenerKind,
    endpoint: Endpoint,
}

impl ChannelListener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, ChannelError> {
        match endpoint {
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self {
                    inner: ListenerKind::Unix(listener),
                    endpoint: endpoint.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                // Port 0 resolves to the real port here.
                let local = listener.local_addr()?;
                Ok(Self {
                    inner: ListenerKind::Tcp(listener),
                    endpoint: Endpoint::Tcp(local),
                })
            }
        }
    }

    /// The address peers should dial.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&self, timeout: Duration) -> Result<MessageChannel, ChannelError> {
        let attempt = async {
            match &self.inner {
                ListenerKind::Unix(listener) => {
                    listener.accept().await.map(|(s, _)| MessageChannel::new(s))
                }
                ListenerKind::Tcp(listener) => listener.accept().await.map(|(s, _)| {
                    let _ = s.set_nodelay(true);
                    MessageChannel::new(s)
                }),
            }
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}
