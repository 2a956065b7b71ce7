use std::path::PathBuf;
use std::time::Duration;

use testplane_protocol::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?} waiting for the peer")]
    Timeout(Duration),

    #[error("invalid endpoint '{0}' (expected unix:<path> or tcp:<addr>)")]
    InvalidEndpoint(String),

    #[error("channel closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobQueueError {
    #[error("job queue disposed")]
    Disposed,
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Queue(#[from] JobQueueError),

    #[error("a {0} call is already waiting for its acknowledgement")]
    CallInProgress(&'static str),

    #[error("no acknowledgement for {operation} within {timeout:?}")]
    CallTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection to the controller is not established")]
    NotConnected,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Failure raised by a discovery or execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),

    #[error("engine panicked: {0}")]
    Panicked(String),

    #[error("engine is not initialized")]
    NotInitialized,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The worker misbehaved at the protocol level. Callers treat this as an
    /// expected setup failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to launch test host: {0}")]
    Launch(#[source] std::io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("proxy channel is not set up")]
    NotConnected,
}

impl ProxyError {
    pub fn is_recognized(&self) -> bool {
        matches!(self, ProxyError::Protocol(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("proxy index {index} out of range (pool size {len})")]
    OutOfRange { index: usize, len: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
