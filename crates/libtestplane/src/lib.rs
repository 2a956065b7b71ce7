pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod job_queue;
pub mod pool;
pub mod proxy;
pub mod registry;

pub use channel::{ConnectionRole, Endpoint, MessageChannel};
pub use config::TestplaneConfig;
pub use engine::{
    DataCollectionGate, DiscoveryEngine, DiscoveryEventsHandler, Engines, ExecutionEngine,
    NoDataCollection, RunEventsHandler, RunRequest, SettingsDataCollectionGate,
    TestCaseEventsHandler, TestRun,
};
pub use error::{
    ChannelError, ConfigError, EngineError, HandlerError, JobQueueError, PoolError, ProxyError,
};
pub use handler::{HandlerConfig, HandlerState, TestRequestHandler};
pub use job_queue::{Job, JobQueue};
pub use pool::{
    DequeuedProxy, LoggingSessionEvents, ProxyAvailability, SessionCriteria,
    SessionEventsHandler, SessionPool, SessionState, StartSessionComplete, StopSessionTelemetry,
};
pub use proxy::{HostProcessLauncher, ProcessProxy, TestHostProxy, WorkerLauncher};
pub use registry::{SessionId, SessionRegistry};
