//! Test host side of the protocol.
//!
//! A [`TestRequestHandler`] owns one connection to the controller. Its receive
//! loop decodes each frame into a [`Command`] and either carries it out inline
//! (version check, initialize, cancel, abort, debugger acknowledgements) or
//! queues the discovery/execution work on a single-consumer [`JobQueue`] so the
//! loop itself never blocks on an engine.

mod events;
mod state;

pub use events::HostEvents;
pub use state::{Command, Event, HandlerState, NegotiationPolicy, plan, transition};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use testplane_protocol::{
    ATTACH_DEBUGGER_MIN_VERSION, AttachDebuggerAck, AttachDebuggerRequest, DiscoveryCompletePayload,
    DiscoveryCriteria, HIGHEST_SUPPORTED_VERSION, LaunchDebuggeeAck, LaunchDebuggeeRequest,
    MessageType, TestCase, TestMessageLevel, TestMessagePayload, TestProcessStartInfo,
    TestRunChangedPayload, TestRunCompletePayload, deserialize, serialize,
};

use crate::channel::{self, ChannelReceiver, ChannelSender, ConnectionRole, Endpoint, MessageChannel};
use crate::config::TestplaneConfig;
use crate::engine::{DiscoveryEventsHandler, Engines, RunEventsHandler, TestRun};
use crate::error::{EngineError, HandlerError};
use crate::job_queue::{Job, JobQueue};

const LAUNCH_DEBUGGEE: &str = "launch-with-debugger";
const ATTACH_DEBUGGER: &str = "attach-debugger";

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub highest_supported_version: u32,
    pub downgrade_disabled: bool,
    pub connection_timeout: Duration,
    pub callback_timeout: Duration,
    pub job_queue_max_bytes: usize,
    /// Announced to the controller once the version is negotiated.
    pub diagnostics_log: Option<PathBuf>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from(&TestplaneConfig::default())
    }
}

impl From<&TestplaneConfig> for HandlerConfig {
    fn from(config: &TestplaneConfig) -> Self {
        Self {
            highest_supported_version: HIGHEST_SUPPORTED_VERSION,
            downgrade_disabled: config.disable_version_downgrade,
            connection_timeout: config.connection_timeout(),
            callback_timeout: config.callback_timeout(),
            job_queue_max_bytes: config.job_queue_max_bytes,
            diagnostics_log: config.diagnostics_log.clone(),
        }
    }
}

/// One-way flag that async code can wait on.
struct Latch(watch::Sender<bool>);

impl Latch {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(tx)
    }

    fn set(&self) {
        self.0.send_replace(true);
    }

    fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Slot for the single outstanding call of one debugger sub-protocol.
struct PendingCall<T> {
    operation: &'static str,
    slot: Mutex<Option<(String, oneshot::Sender<T>)>>,
}

impl<T> PendingCall<T> {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<(String, oneshot::Sender<T>)>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> Result<(String, oneshot::Receiver<T>), HandlerError> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|(_, waiter)| !waiter.is_closed()) {
            return Err(HandlerError::CallInProgress(self.operation));
        }
        let call_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        *slot = Some((call_id.clone(), tx));
        Ok((call_id, rx))
    }

    /// Hand `value` to the waiter. An ack without a call id matches whatever
    /// call is outstanding.
    fn resolve(&self, call_id: Option<&str>, value: T) -> bool {
        let mut slot = self.lock();
        let matches = match (slot.as_ref(), call_id) {
            (Some(_), None) => true,
            (Some((pending, _)), Some(id)) => pending == id,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        match slot.take() {
            Some((_, waiter)) => waiter.send(value).is_ok(),
            None => false,
        }
    }

    fn clear(&self, call_id: &str) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|(pending, _)| pending == call_id) {
            *slot = None;
        }
    }

    /// Fail the outstanding call, if any.
    fn cancel(&self) {
        self.lock().take();
    }
}

pub struct TestRequestHandler {
    config: HandlerConfig,
    runtime: Handle,
    state: Mutex<HandlerState>,
    /// 0 until the version check completes.
    version: AtomicU32,
    sender: Mutex<Option<ChannelSender>>,
    jobs: JobQueue,
    engines: Mutex<Option<Engines>>,
    engine_ready: Latch,
    session_completed: Latch,
    captured_error: Mutex<Option<String>>,
    launch_call: PendingCall<LaunchDebuggeeAck>,
    attach_call: PendingCall<AttachDebuggerAck>,
}

impl TestRequestHandler {
    /// Must be called inside a tokio runtime.
    pub fn new(config: HandlerConfig) -> Arc<Self> {
        let jobs = JobQueue::new("test-host", config.job_queue_max_bytes);
        Arc::new(Self {
            config,
            runtime: Handle::current(),
            state: Mutex::new(HandlerState::Idle),
            version: AtomicU32::new(0),
            sender: Mutex::new(None),
            jobs,
            engines: Mutex::new(None),
            engine_ready: Latch::new(),
            session_completed: Latch::new(),
            captured_error: Mutex::new(None),
            launch_call: PendingCall::new(LAUNCH_DEBUGGEE),
            attach_call: PendingCall::new(ATTACH_DEBUGGER),
        })
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Negotiated protocol version, or 0 before the version check.
    pub fn protocol_version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_session_completed(&self) -> bool {
        self.session_completed.is_set()
    }

    fn advance(&self, event: Event<'_>) -> HandlerState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = transition(*state, event);
        if next != *state {
            debug!(from = ?*state, to = ?next, "handler state changed");
            *state = next;
        }
        next
    }

    fn policy(&self) -> NegotiationPolicy {
        NegotiationPolicy {
            highest_supported: self.config.highest_supported_version,
            downgrade_disabled: self.config.downgrade_disabled,
        }
    }

    /// Open the channel to the controller and start receiving.
    ///
    /// A failed connect leaves the handler `Faulted` and completes the session
    /// so [`process_requests`](Self::process_requests) returns.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        role: ConnectionRole,
    ) -> Result<(), HandlerError> {
        self.advance(Event::ConnectStarted);
        match channel::open(endpoint, role, self.config.connection_timeout).await {
            Ok(channel) => {
                info!(endpoint = %endpoint, ?role, "connected to controller");
                self.attach(channel);
                Ok(())
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "failed to connect to controller");
                self.advance(Event::ConnectFailed);
                self.session_completed.set();
                self.jobs.dispose();
                Err(e.into())
            }
        }
    }

    /// Start serving an already connected channel.
    pub fn attach(self: &Arc<Self>, channel: MessageChannel) {
        let (sender, receiver) = channel.split();
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        self.advance(Event::Connected);

        let handler = Arc::clone(self);
        self.runtime.spawn(async move { handler.receive_loop(receiver).await });
    }

    async fn receive_loop(self: Arc<Self>, mut receiver: ChannelReceiver) {
        while let Some(frame) = receiver.recv().await {
            match frame {
                Ok(bytes) => self.on_message_received(&bytes).await,
                Err(e) => {
                    warn!(error = %e, "channel receive failed");
                    break;
                }
            }
        }
        debug!("controller connection closed");
        self.close();
    }

    async fn on_message_received(self: &Arc<Self>, bytes: &[u8]) {
        let command = match deserialize(bytes).and_then(|message| {
            debug!(
                message_type = %message.message_type,
                version = message.version,
                "message received"
            );
            plan(&message, &self.policy())
        }) {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, "failed to process message, aborting");
                self.capture_error(e.to_string());
                Command::Abort
            }
        };
        self.dispatch(command, bytes.len()).await;
    }

    async fn dispatch(self: &Arc<Self>, command: Command, size: usize) {
        let aborts_on_failure = command.aborts_on_failure();
        self.advance(Event::Command(&command));

        if let Err(e) = self.execute(command, size).await {
            if aborts_on_failure {
                error!(error = %e, "request failed, aborting");
                self.capture_error(e.to_string());
                self.advance(Event::Command(&Command::Abort));
                self.abort_run().await;
            } else {
                warn!(error = %e, "request failed");
            }
        }
    }

    async fn execute(self: &Arc<Self>, command: Command, size: usize) -> Result<(), HandlerError> {
        match command {
            Command::Negotiate { proposed, version } => self.complete_version_check(proposed, version),
            Command::InitializeDiscovery(paths) => {
                let engines = self.wait_for_engines().await?;
                let events: Arc<dyn DiscoveryEventsHandler> = self.host_events();
                run_blocking(move || engines.discovery.initialize(&paths, events)).await?;
                Ok(())
            }
            Command::InitializeExecution(paths) => {
                let engines = self.wait_for_engines().await?;
                let events: Arc<dyn RunEventsHandler> = self.host_events();
                run_blocking(move || engines.execution.initialize(&paths, events)).await?;
                Ok(())
            }
            Command::StartDiscovery(criteria) => {
                let handler = Arc::clone(self);
                self.queue(Job::new(
                    async move { handler.run_discovery(criteria).await },
                    0,
                    size,
                ))
                .await
            }
            Command::StartRun(run) => {
                let handler = Arc::clone(self);
                self.queue(Job::new(async move { handler.run_tests(run).await }, 0, size))
                    .await
            }
            Command::Cancel => {
                self.jobs.pause();
                let engines = self.wait_for_engines().await?;
                let events: Arc<dyn RunEventsHandler> = self.host_events();
                run_blocking(move || engines.execution.cancel(events)).await?;
                Ok(())
            }
            Command::Abort => {
                self.abort_run().await;
                Ok(())
            }
            Command::LaunchCallback(ack) => {
                let call_id = ack.call_id.clone();
                if !self.launch_call.resolve(call_id.as_deref(), ack) {
                    warn!(call_id = ?call_id, "dropping unexpected launch acknowledgement");
                }
                Ok(())
            }
            Command::AttachCallback(ack) => {
                let call_id = ack.call_id.clone();
                if !self.attach_call.resolve(call_id.as_deref(), ack) {
                    warn!(call_id = ?call_id, "dropping unexpected attach acknowledgement");
                }
                Ok(())
            }
            Command::EndSession => {
                info!("session end requested");
                self.close();
                Ok(())
            }
            Command::Ignore { tag } => {
                debug!(message_type = %tag, "ignoring message");
                Ok(())
            }
        }
    }

    fn complete_version_check(&self, proposed: u32, version: u32) -> Result<(), HandlerError> {
        // The version is fixed by the first check; later checks get it echoed back.
        if let Err(current) =
            self.version
                .compare_exchange(0, version, Ordering::SeqCst, Ordering::SeqCst)
        {
            warn!(proposed, current, "repeated version check, keeping negotiated version");
            let reply = serialize(MessageType::VersionCheck, &current, 0)?;
            self.sender()?.send(reply)?;
            return Ok(());
        }

        // The reply still travels in the pre-negotiation envelope.
        let reply = serialize(MessageType::VersionCheck, &version, 0)?;
        self.sender()?.send(reply)?;
        info!(proposed, version, "protocol version negotiated");

        if let Some(path) = &self.config.diagnostics_log {
            let notice = format!("Logging test host diagnostics in file: {}", path.display());
            if let Err(e) = self.send_log(TestMessageLevel::Informational, &notice) {
                debug!(error = %e, "could not send diagnostics notice");
            }
        }
        Ok(())
    }

    /// Queue a Start* job. A backlog left over from a cancel or abort is stale
    /// and is dropped before the queue resumes.
    async fn queue(&self, job: Job) -> Result<(), HandlerError> {
        if self.jobs.is_paused() {
            let dropped = self.jobs.discard_pending();
            if dropped > 0 {
                info!(dropped, "discarded jobs queued before cancellation");
            }
            self.jobs.resume();
        }
        self.jobs.queue_job(job).await?;
        Ok(())
    }

    async fn run_discovery(self: Arc<Self>, criteria: DiscoveryCriteria) {
        let result = match self.wait_for_engines().await {
            Ok(engines) => {
                let events: Arc<dyn DiscoveryEventsHandler> = self.host_events();
                run_blocking(move || engines.discovery.discover_tests(criteria, events)).await
            }
            Err(e) => {
                debug!(error = %e, "discovery skipped");
                return;
            }
        };

        if let Err(e) = result {
            error!(error = %e, "test discovery failed");
            let message = format!("Test discovery failed: {e}");
            if let Err(e) = self.send_log(TestMessageLevel::Error, &message) {
                warn!(error = %e, "could not report discovery failure");
            }
            if let Err(e) = self.discovery_complete(DiscoveryCompletePayload::aborted()) {
                warn!(error = %e, "could not send aborted discovery completion");
            }
        }
    }

    async fn run_tests(self: Arc<Self>, run: TestRun) {
        let result = match self.wait_for_engines().await {
            Ok(engines) => {
                let test_case_events = engines
                    .data_collection
                    .test_case_events_handler(&run.run_settings);
                let events: Arc<dyn RunEventsHandler> = self.host_events();
                run_blocking(move || {
                    engines
                        .execution
                        .start_test_run(run, test_case_events, events)
                })
                .await
            }
            Err(e) => {
                debug!(error = %e, "test run skipped");
                return;
            }
        };

        if let Err(e) = result {
            error!(error = %e, "test run failed");
            let complete = TestRunCompletePayload::aborted(Some(e.to_string()));
            if let Err(e) = self.send_execution_complete(complete) {
                warn!(error = %e, "could not send aborted run completion");
            }
        }
    }

    /// Abort is the last line of defence: if the engine cannot abort, the
    /// connection is closed.
    async fn abort_run(self: &Arc<Self>) {
        self.jobs.pause();
        let engines = match self.wait_for_engines().await {
            Ok(engines) => engines,
            Err(e) => {
                warn!(error = %e, "abort without engines, closing");
                self.close();
                return;
            }
        };
        let events: Arc<dyn RunEventsHandler> = self.host_events();
        if let Err(e) = run_blocking(move || engines.execution.abort(events)).await {
            error!(error = %e, "abort failed, closing connection");
            self.close();
        }
    }

    async fn wait_for_engines(&self) -> Result<Engines, HandlerError> {
        tokio::select! {
            biased;
            _ = self.engine_ready.wait() => {}
            _ = self.session_completed.wait() => return Err(HandlerError::NotConnected),
        }
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HandlerError::Engine(EngineError::NotInitialized))
    }

    fn host_events(self: &Arc<Self>) -> Arc<HostEvents> {
        Arc::new(HostEvents::new(Arc::clone(self), self.runtime.clone()))
    }

    fn capture_error(&self, error: String) {
        *self
            .captured_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Hand over the engines and wait until the session ends.
    pub async fn process_requests(&self, engines: Engines) {
        *self.engines.lock().unwrap_or_else(PoisonError::into_inner) = Some(engines);
        self.engine_ready.set();
        debug!("engines ready, processing requests");
        self.session_completed.wait().await;
        self.jobs.dispose();
        info!("session completed");
    }

    /// End the session. Idempotent.
    pub fn close(&self) {
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            sender.close();
        }
        self.launch_call.cancel();
        self.attach_call.cancel();
        self.advance(Event::ConnectionClosed);
        self.jobs.dispose();
        self.session_completed.set();
    }

    fn sender(&self) -> Result<ChannelSender, HandlerError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HandlerError::NotConnected)
    }

    fn send<T: Serialize>(&self, kind: MessageType, payload: &T) -> Result<(), HandlerError> {
        let frame = serialize(kind, payload, self.protocol_version())?;
        self.sender()?.send(frame)?;
        Ok(())
    }

    pub fn send_test_cases(&self, tests: Vec<TestCase>) -> Result<(), HandlerError> {
        self.send(MessageType::TestCasesFound, &tests)
    }

    pub fn send_test_run_statistics(&self, change: TestRunChangedPayload) -> Result<(), HandlerError> {
        self.send(MessageType::TestRunStatsChange, &change)
    }

    pub fn send_log(&self, level: TestMessageLevel, message: &str) -> Result<(), HandlerError> {
        self.send(
            MessageType::TestMessage,
            &TestMessagePayload {
                level,
                message: message.to_string(),
            },
        )
    }

    /// A completion without an error of its own carries the error that caused
    /// the handler to abort, if there is one.
    pub fn send_execution_complete(
        &self,
        mut complete: TestRunCompletePayload,
    ) -> Result<(), HandlerError> {
        if complete.complete.error.is_none() {
            complete.complete.error = self
                .captured_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        self.send(MessageType::ExecutionComplete, &complete)
    }

    pub fn discovery_complete(&self, complete: DiscoveryCompletePayload) -> Result<(), HandlerError> {
        self.send(MessageType::DiscoveryComplete, &complete)
    }

    /// Ask the controller to launch `start_info` under a debugger and wait for
    /// the resulting process id.
    pub async fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, HandlerError> {
        let (call_id, reply) = self.launch_call.register()?;
        let request = LaunchDebuggeeRequest {
            call_id: call_id.clone(),
            start_info,
        };
        if let Err(e) = self.send(MessageType::LaunchAdapterProcessWithDebuggerAttached, &request) {
            self.launch_call.clear(&call_id);
            return Err(e);
        }
        let ack = self.await_ack(&self.launch_call, &call_id, reply).await?;
        Ok(ack.process_id)
    }

    /// Ask the controller to attach a debugger to `process_id`. Peers that
    /// predate the capability get `false` without a message being sent.
    pub async fn attach_debugger(
        &self,
        process_id: u32,
        target_framework: Option<String>,
    ) -> Result<bool, HandlerError> {
        let version = self.protocol_version();
        if version < ATTACH_DEBUGGER_MIN_VERSION {
            warn!(
                version,
                required = ATTACH_DEBUGGER_MIN_VERSION,
                "controller does not support attaching a debugger"
            );
            return Ok(false);
        }

        let (call_id, reply) = self.attach_call.register()?;
        let request = AttachDebuggerRequest {
            call_id: call_id.clone(),
            process_id,
            target_framework,
        };
        if let Err(e) = self.send(MessageType::AttachDebugger, &request) {
            self.attach_call.clear(&call_id);
            return Err(e);
        }
        let ack = self.await_ack(&self.attach_call, &call_id, reply).await?;
        Ok(ack.attached)
    }

    async fn await_ack<T>(
        &self,
        call: &PendingCall<T>,
        call_id: &str,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, HandlerError> {
        match tokio::time::timeout(self.config.callback_timeout, reply).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(HandlerError::NotConnected),
            Err(_) => {
                call.clear(call_id);
                Err(HandlerError::CallTimeout {
                    operation: call.operation,
                    timeout: self.config.callback_timeout,
                })
            }
        }
    }
}

/// Run an engine call on the blocking pool, turning a panic into an error.
async fn run_blocking<F>(call: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<(), EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(join_failure)?
}

fn join_failure(e: JoinError) -> EngineError {
    if !e.is_panic() {
        return EngineError::Failed("engine call was cancelled".to_string());
    }
    let panic = e.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    EngineError::Panicked(message)
}
