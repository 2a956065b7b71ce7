//! Interfaces the request handler drives: the discovery and execution engines
//! that do the real work inside a test host, the callbacks they report
//! through, and the data-collection gate.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use testplane_protocol::{
    AdapterSourceMap, DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestExecutionContext,
    TestMessageLevel, TestOutcome, TestProcessStartInfo, TestResult, TestRunChangedPayload,
    TestRunCompletePayload, TestRunCriteriaWithSources, TestRunCriteriaWithTests,
};

use crate::error::{EngineError, HandlerError};

pub trait DiscoveryEventsHandler: Send + Sync {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>);
    fn handle_discovery_complete(&self, complete: DiscoveryCompletePayload);
    fn handle_log(&self, level: TestMessageLevel, message: &str);
}

/// Run-side callbacks. The two debugger calls block until the controller
/// answers, so engines must only invoke them from their own (blocking) thread.
pub trait RunEventsHandler: Send + Sync {
    fn handle_test_run_stats_change(&self, change: TestRunChangedPayload);
    fn handle_test_run_complete(&self, complete: TestRunCompletePayload);
    fn handle_log(&self, level: TestMessageLevel, message: &str);
    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, HandlerError>;
    fn attach_debugger(
        &self,
        process_id: u32,
        target_framework: Option<String>,
    ) -> Result<bool, HandlerError>;
}

/// Per-test notifications consumed by in-process data collection.
pub trait TestCaseEventsHandler: Send + Sync {
    fn send_test_case_start(&self, test: &TestCase);
    fn send_test_case_end(&self, test: &TestCase, outcome: TestOutcome);
    fn send_test_result(&self, result: &TestResult);
}

pub trait DiscoveryEngine: Send + Sync {
    fn initialize(
        &self,
        extension_paths: &[String],
        events: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<(), EngineError>;

    /// Must finish by calling `handle_discovery_complete` on success.
    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        events: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunRequest {
    Sources(AdapterSourceMap),
    Tests(Vec<TestCase>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    pub request: RunRequest,
    pub package: Option<String>,
    pub run_settings: String,
    pub context: TestExecutionContext,
}

impl From<TestRunCriteriaWithSources> for TestRun {
    fn from(criteria: TestRunCriteriaWithSources) -> Self {
        Self {
            request: RunRequest::Sources(criteria.adapter_source_map),
            package: criteria.package,
            run_settings: criteria.run_settings,
            context: criteria.test_execution_context,
        }
    }
}

impl From<TestRunCriteriaWithTests> for TestRun {
    fn from(criteria: TestRunCriteriaWithTests) -> Self {
        Self {
            request: RunRequest::Tests(criteria.tests),
            package: criteria.package,
            run_settings: criteria.run_settings,
            context: criteria.test_execution_context,
        }
    }
}

pub trait ExecutionEngine: Send + Sync {
    fn initialize(
        &self,
        extension_paths: &[String],
        events: Arc<dyn RunEventsHandler>,
    ) -> Result<(), EngineError>;

    /// Must finish by calling `handle_test_run_complete` on success.
    fn start_test_run(
        &self,
        run: TestRun,
        test_case_events: Option<Arc<dyn TestCaseEventsHandler>>,
        events: Arc<dyn RunEventsHandler>,
    ) -> Result<(), EngineError>;

    fn cancel(&self, events: Arc<dyn RunEventsHandler>) -> Result<(), EngineError>;

    fn abort(&self, events: Arc<dyn RunEventsHandler>) -> Result<(), EngineError>;
}

/// Decides from the run settings whether per-test events are needed.
pub trait DataCollectionGate: Send + Sync {
    fn test_case_events_handler(&self, run_settings: &str)
    -> Option<Arc<dyn TestCaseEventsHandler>>;
}

pub struct NoDataCollection;

impl DataCollectionGate for NoDataCollection {
    fn test_case_events_handler(
        &self,
        _run_settings: &str,
    ) -> Option<Arc<dyn TestCaseEventsHandler>> {
        None
    }
}

#[derive(Deserialize, Default)]
struct DataCollectionSettings {
    #[serde(default)]
    collect_test_case_events: bool,
}

/// Hands out `handler` when the run settings JSON sets
/// `"collect_test_case_events": true`.
pub struct SettingsDataCollectionGate {
    handler: Arc<dyn TestCaseEventsHandler>,
}

impl SettingsDataCollectionGate {
    pub fn new(handler: Arc<dyn TestCaseEventsHandler>) -> Self {
        Self { handler }
    }
}

impl DataCollectionGate for SettingsDataCollectionGate {
    fn test_case_events_handler(
        &self,
        run_settings: &str,
    ) -> Option<Arc<dyn TestCaseEventsHandler>> {
        if run_settings.trim().is_empty() {
            return None;
        }
        let settings: DataCollectionSettings = match serde_json::from_str(run_settings) {
            Ok(settings) => settings,
            Err(e) => {
                debug!(error = %e, "run settings are not data collection JSON");
                return None;
            }
        };
        settings
            .collect_test_case_events
            .then(|| Arc::clone(&self.handler))
    }
}

/// Engines handed to the request handler once the host is ready.
#[derive(Clone)]
pub struct Engines {
    pub discovery: Arc<dyn DiscoveryEngine>,
    pub execution: Arc<dyn ExecutionEngine>,
    pub data_collection: Arc<dyn DataCollectionGate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl TestCaseEventsHandler for Noop {
        fn send_test_case_start(&self, _test: &TestCase) {}
        fn send_test_case_end(&self, _test: &TestCase, _outcome: TestOutcome) {}
        fn send_test_result(&self, _result: &TestResult) {}
    }

    #[test]
    fn gate_enabled_only_by_flag() {
        let gate = SettingsDataCollectionGate::new(Arc::new(Noop));
        assert!(
            gate.test_case_events_handler(r#"{"collect_test_case_events":true}"#)
                .is_some()
        );
        assert!(
            gate.test_case_events_handler(r#"{"collect_test_case_events":false}"#)
                .is_none()
        );
        assert!(gate.test_case_events_handler("{}").is_none());
        assert!(gate.test_case_events_handler("").is_none());
        assert!(gate.test_case_events_handler("<RunSettings/>").is_none());
    }

    #[test]
    fn run_from_criteria_keeps_request_kind() {
        let mut sources = AdapterSourceMap::new();
        sources.insert("_none_".to_string(), vec!["a".to_string()]);
        let run = TestRun::from(TestRunCriteriaWithSources {
            adapter_source_map: sources.clone(),
            run_settings: "{}".to_string(),
            ..Default::default()
        });
        assert_eq!(run.request, RunRequest::Sources(sources));

        let run = TestRun::from(TestRunCriteriaWithTests::default());
        assert_eq!(run.request, RunRequest::Tests(Vec::new()));
    }
}
