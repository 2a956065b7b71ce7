//! Controller side: starts a session of test hosts, fans the sources out over
//! them and collects what they report.

use std::sync::Arc;

use anyhow::{Context, bail};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use libtestplane::{
    HostProcessLauncher, LoggingSessionEvents, ProcessProxy, SessionCriteria, SessionPool,
    SessionRegistry, TestplaneConfig, WorkerLauncher,
};
use testplane_protocol::{
    AdapterSourceMap, AttachDebuggerAck, AttachDebuggerRequest, DiscoveryCompletePayload,
    DiscoveryCriteria, LaunchDebuggeeAck, LaunchDebuggeeRequest, Message, MessageType, TestCase,
    TestMessageLevel, TestMessagePayload, TestResult, TestRunChangedPayload,
    TestRunCompletePayload, TestRunCriteriaWithSources, TestRunStatistics, deserialize_payload,
};

/// Adapter key used when sources are not grouped by extension.
const DEFAULT_ADAPTER: &str = "_none_";
const DISCOVERY_CHUNK: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    pub tests: Vec<TestCase>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub results: Vec<TestResult>,
    pub stats: TestRunStatistics,
    pub aborted: bool,
    pub canceled: bool,
    pub errors: Vec<String>,
}

impl RunReport {
    fn merge(&mut self, other: RunReport) {
        self.results.extend(other.results);
        self.stats.executed_tests += other.stats.executed_tests;
        for (outcome, count) in other.stats.stats {
            *self.stats.stats.entry(outcome).or_insert(0) += count;
        }
        self.aborted |= other.aborted;
        self.canceled |= other.canceled;
        self.errors.extend(other.errors);
    }
}

pub struct Controller {
    config: TestplaneConfig,
    registry: Arc<SessionRegistry<ProcessProxy>>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Controller {
    pub fn new(config: TestplaneConfig) -> Self {
        let launcher = Arc::new(HostProcessLauncher::new(config.host_executable.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: TestplaneConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            launcher,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<ProcessProxy>> {
        &self.registry
    }

    async fn start_session(
        &self,
        criteria: SessionCriteria,
    ) -> anyhow::Result<Arc<SessionPool<ProcessProxy>>> {
        if criteria.sources.is_empty() {
            bail!("no test sources given");
        }
        std::fs::create_dir_all(&self.config.runtime_dir).with_context(|| {
            format!(
                "failed to create runtime dir {}",
                self.config.runtime_dir.display()
            )
        })?;

        let config = self.config.clone();
        let launcher = Arc::clone(&self.launcher);
        let pool = SessionPool::new(
            criteria,
            move || ProcessProxy::new(&config, Arc::clone(&launcher)),
            Arc::clone(&self.registry),
            Arc::new(LoggingSessionEvents),
        );
        if !pool.start_session().await {
            pool.stop_session().await;
            bail!("failed to start test hosts for session {}", pool.id());
        }
        Ok(pool)
    }

    /// Discover the tests in every source, one test host per batch.
    pub async fn discover(&self, criteria: SessionCriteria) -> anyhow::Result<DiscoveryReport> {
        let pool = self.start_session(criteria).await?;
        let run_settings = pool.criteria().run_settings.clone();

        let outcomes = join_all((0..pool.proxy_count()).map(|index| {
            let pool = Arc::clone(&pool);
            let run_settings = run_settings.clone();
            async move {
                let sources = pool.sources_of(index).unwrap_or_default();
                let first = sources.first().context("test host serves no sources")?;
                let held = pool.dequeue_proxy(first, &run_settings)?;
                let report = drive_discovery(&held.proxy, &sources, &run_settings).await;
                pool.enqueue_proxy(held.index)?;
                report
            }
        }))
        .await;
        pool.stop_session().await;

        let mut report = DiscoveryReport::default();
        for outcome in outcomes {
            let partial = outcome?;
            report.tests.extend(partial.tests);
            report.aborted |= partial.aborted;
        }
        info!(tests = report.tests.len(), aborted = report.aborted, "discovery complete");
        Ok(report)
    }

    /// Run every source, one test host per batch.
    pub async fn run(&self, criteria: SessionCriteria) -> anyhow::Result<RunReport> {
        let pool = self.start_session(criteria).await?;
        let run_settings = pool.criteria().run_settings.clone();

        let outcomes = join_all((0..pool.proxy_count()).map(|index| {
            let pool = Arc::clone(&pool);
            let run_settings = run_settings.clone();
            async move {
                let sources = pool.sources_of(index).unwrap_or_default();
                let first = sources.first().context("test host serves no sources")?;
                let held = pool.dequeue_proxy(first, &run_settings)?;
                let report = drive_run(&held.proxy, &sources, &run_settings).await;
                pool.enqueue_proxy(held.index)?;
                report
            }
        }))
        .await;
        pool.stop_session().await;

        let mut report = RunReport::default();
        for outcome in outcomes {
            report.merge(outcome?);
        }
        info!(
            executed = report.stats.executed_tests,
            aborted = report.aborted,
            "run complete"
        );
        Ok(report)
    }
}

fn source_map(sources: &[String]) -> AdapterSourceMap {
    let mut map = AdapterSourceMap::new();
    map.insert(DEFAULT_ADAPTER.to_string(), sources.to_vec());
    map
}

async fn next_message(proxy: &ProcessProxy) -> anyhow::Result<Message> {
    proxy
        .recv()
        .await?
        .context("test host hung up before completing")
}

fn payload<T: serde::de::DeserializeOwned>(message: &Message) -> anyhow::Result<T> {
    deserialize_payload(message)
        .with_context(|| format!("malformed {} payload", message.message_type))
}

fn reply<T: Serialize>(proxy: &ProcessProxy, kind: MessageType, ack: &T) -> anyhow::Result<()> {
    proxy
        .send(kind, ack)
        .with_context(|| format!("failed to send {kind}"))
}

/// Handle messages every phase can see. Returns false for anything else.
fn handle_common(proxy: &ProcessProxy, message: &Message) -> anyhow::Result<bool> {
    match message.kind() {
        Some(MessageType::TestMessage) => {
            let log: TestMessagePayload = payload(message)?;
            match log.level {
                TestMessageLevel::Informational => info!(message = %log.message, "test host"),
                TestMessageLevel::Warning => warn!(message = %log.message, "test host"),
                TestMessageLevel::Error => warn!(message = %log.message, "test host error"),
            }
            Ok(true)
        }
        // No debugger is available from the command line.
        Some(MessageType::LaunchAdapterProcessWithDebuggerAttached) => {
            let request: LaunchDebuggeeRequest = payload(message)?;
            debug!(file = %request.start_info.file_name, "declining debuggee launch");
            reply(
                proxy,
                MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback,
                &LaunchDebuggeeAck {
                    call_id: Some(request.call_id),
                    process_id: -1,
                },
            )?;
            Ok(true)
        }
        Some(MessageType::AttachDebugger) => {
            let request: AttachDebuggerRequest = payload(message)?;
            debug!(pid = request.process_id, "declining debugger attach");
            reply(
                proxy,
                MessageType::AttachDebuggerCallback,
                &AttachDebuggerAck {
                    call_id: Some(request.call_id),
                    attached: false,
                },
            )?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn drive_discovery(
    proxy: &ProcessProxy,
    sources: &[String],
    run_settings: &str,
) -> anyhow::Result<DiscoveryReport> {
    proxy.send(MessageType::DiscoveryInitialize, &Vec::<String>::new())?;
    proxy.send(
        MessageType::StartDiscovery,
        &DiscoveryCriteria {
            adapter_source_map: source_map(sources),
            frequency_of_discovered_tests_event: DISCOVERY_CHUNK,
            run_settings: run_settings.to_string(),
            ..DiscoveryCriteria::default()
        },
    )?;

    let mut report = DiscoveryReport::default();
    loop {
        let message = next_message(proxy).await?;
        if handle_common(proxy, &message)? {
            continue;
        }
        match message.kind() {
            Some(MessageType::TestCasesFound) => {
                let tests: Vec<TestCase> = payload(&message)?;
                report.tests.extend(tests);
            }
            Some(MessageType::DiscoveryComplete) => {
                let complete: DiscoveryCompletePayload = payload(&message)?;
                report.tests.extend(complete.last_discovered_tests.unwrap_or_default());
                report.aborted = complete.is_aborted;
                return Ok(report);
            }
            // The host aborted before discovery could report.
            Some(MessageType::ExecutionComplete) => {
                let complete: TestRunCompletePayload = payload(&message)?;
                warn!(error = ?complete.complete.error, "test host aborted during discovery");
                report.aborted = true;
                return Ok(report);
            }
            _ => debug!(tag = %message.message_type, "ignoring message during discovery"),
        }
    }
}

async fn drive_run(
    proxy: &ProcessProxy,
    sources: &[String],
    run_settings: &str,
) -> anyhow::Result<RunReport> {
    proxy.send(MessageType::ExecutionInitialize, &Vec::<String>::new())?;
    proxy.send(
        MessageType::StartTestExecutionWithSources,
        &TestRunCriteriaWithSources {
            adapter_source_map: source_map(sources),
            run_settings: run_settings.to_string(),
            ..TestRunCriteriaWithSources::default()
        },
    )?;

    let mut report = RunReport::default();
    loop {
        let message = next_message(proxy).await?;
        if handle_common(proxy, &message)? {
            continue;
        }
        match message.kind() {
            Some(MessageType::TestRunStatsChange) => {
                let change: TestRunChangedPayload = payload(&message)?;
                report.results.extend(change.new_test_results);
            }
            Some(MessageType::ExecutionComplete) => {
                let complete: TestRunCompletePayload = payload(&message)?;
                if let Some(last) = complete.last_run_tests {
                    report.results.extend(last.new_test_results);
                }
                report.stats = complete.complete.stats;
                report.aborted = complete.complete.is_aborted;
                report.canceled = complete.complete.is_canceled;
                report.errors.extend(complete.complete.error);
                return Ok(report);
            }
            _ => debug!(tag = %message.message_type, "ignoring message during run"),
        }
    }
}
