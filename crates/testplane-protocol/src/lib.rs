pub mod codec;
pub mod paths;
pub mod version;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub use codec::{
    CodecError, Message, deserialize, deserialize_payload, serialize, serialize_empty,
};
pub use version::{
    ATTACH_DEBUGGER_MIN_VERSION, DISABLE_DOWNGRADE_ENV, HIGHEST_SUPPORTED_VERSION,
    negotiate_version,
};

/// Upper bound for a single frame on the wire.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Every message kind exchanged between a controller and a test host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    VersionCheck,
    DiscoveryInitialize,
    StartDiscovery,
    TestCasesFound,
    DiscoveryComplete,
    ExecutionInitialize,
    StartTestExecutionWithSources,
    StartTestExecutionWithTests,
    TestRunStatsChange,
    ExecutionComplete,
    TestMessage,
    CancelTestRun,
    AbortTestRun,
    SessionEnd,
    SessionAbort,
    LaunchAdapterProcessWithDebuggerAttached,
    LaunchAdapterProcessWithDebuggerAttachedCallback,
    AttachDebugger,
    AttachDebuggerCallback,
}

impl MessageType {
    pub const ALL: [MessageType; 19] = [
        MessageType::VersionCheck,
        MessageType::DiscoveryInitialize,
        MessageType::StartDiscovery,
        MessageType::TestCasesFound,
        MessageType::DiscoveryComplete,
        MessageType::ExecutionInitialize,
        MessageType::StartTestExecutionWithSources,
        MessageType::StartTestExecutionWithTests,
        MessageType::TestRunStatsChange,
        MessageType::ExecutionComplete,
        MessageType::TestMessage,
        MessageType::CancelTestRun,
        MessageType::AbortTestRun,
        MessageType::SessionEnd,
        MessageType::SessionAbort,
        MessageType::LaunchAdapterProcessWithDebuggerAttached,
        MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback,
        MessageType::AttachDebugger,
        MessageType::AttachDebuggerCallback,
    ];

    /// Tag written into the envelope.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::VersionCheck => "ProtocolVersion",
            MessageType::DiscoveryInitialize => "TestDiscovery.Initialize",
            MessageType::StartDiscovery => "TestDiscovery.Start",
            MessageType::TestCasesFound => "TestDiscovery.TestFound",
            MessageType::DiscoveryComplete => "TestDiscovery.Completed",
            MessageType::ExecutionInitialize => "TestExecution.Initialize",
            MessageType::StartTestExecutionWithSources => "TestExecution.StartWithSources",
            MessageType::StartTestExecutionWithTests => "TestExecution.StartWithTests",
            MessageType::TestRunStatsChange => "TestExecution.StatsChange",
            MessageType::ExecutionComplete => "TestExecution.Completed",
            MessageType::TestMessage => "TestSession.Message",
            MessageType::CancelTestRun => "TestExecution.Cancel",
            MessageType::AbortTestRun => "TestExecution.Abort",
            MessageType::SessionEnd => "TestSession.Terminate",
            MessageType::SessionAbort => "TestSession.Abort",
            MessageType::LaunchAdapterProcessWithDebuggerAttached => {
                "TestExecution.LaunchAdapterProcessWithDebuggerAttached"
            }
            MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback => {
                "TestExecution.LaunchAdapterProcessWithDebuggerAttachedCallback"
            }
            MessageType::AttachDebugger => "TestExecution.AttachDebugger",
            MessageType::AttachDebuggerCallback => "TestExecution.AttachDebuggerCallback",
        }
    }

    /// Map a wire tag back to a known type. Tags from newer peers yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single discovered test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub executor_uri: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl TestCase {
    pub fn new(
        fully_qualified_name: impl Into<String>,
        executor_uri: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        let source = source.into();
        // Stable across discovery and execution of the same source.
        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{source}::{fully_qualified_name}").as_bytes(),
        );
        Self {
            id,
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            executor_uri: executor_uri.into(),
            source,
            code_file_path: None,
            line_number: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunStatistics {
    pub executed_tests: u64,
    #[serde(default)]
    pub stats: BTreeMap<TestOutcome, u64>,
}

impl TestRunStatistics {
    pub fn record(&mut self, outcome: TestOutcome) {
        self.executed_tests += 1;
        *self.stats.entry(outcome).or_insert(0) += 1;
    }

    pub fn count(&self, outcome: TestOutcome) -> u64 {
        self.stats.get(&outcome).copied().unwrap_or(0)
    }
}

/// Source files grouped by the adapter (extension) expected to handle them.
pub type AdapterSourceMap = BTreeMap<String, Vec<String>>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DiscoveryCriteria {
    pub adapter_source_map: AdapterSourceMap,
    #[serde(default = "default_event_frequency")]
    pub frequency_of_discovered_tests_event: usize,
    #[serde(default)]
    pub run_settings: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestExecutionContext {
    #[serde(default = "default_event_frequency")]
    pub frequency_of_run_stats_change_event: usize,
    #[serde(default = "default_stats_timeout_ms")]
    pub run_stats_change_event_timeout_ms: u64,
    #[serde(default)]
    pub in_isolation: bool,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub are_tests_debugging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_filter: Option<String>,
}

impl Default for TestExecutionContext {
    fn default() -> Self {
        Self {
            frequency_of_run_stats_change_event: default_event_frequency(),
            run_stats_change_event_timeout_ms: default_stats_timeout_ms(),
            in_isolation: false,
            keep_alive: false,
            are_tests_debugging: false,
            test_case_filter: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestRunCriteriaWithSources {
    pub adapter_source_map: AdapterSourceMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub run_settings: String,
    #[serde(default)]
    pub test_execution_context: TestExecutionContext,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestRunCriteriaWithTests {
    pub tests: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub run_settings: String,
    #[serde(default)]
    pub test_execution_context: TestExecutionContext,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiscoveryCompletePayload {
    pub total_tests: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_discovered_tests: Option<Vec<TestCase>>,
    pub is_aborted: bool,
}

impl DiscoveryCompletePayload {
    /// The shape reported when discovery could not finish.
    pub fn aborted() -> Self {
        Self {
            total_tests: -1,
            last_discovered_tests: None,
            is_aborted: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestRunChangedPayload {
    #[serde(default)]
    pub new_test_results: Vec<TestResult>,
    #[serde(default)]
    pub stats: TestRunStatistics,
    #[serde(default)]
    pub active_tests: Vec<TestCase>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestRunCompleteArgs {
    #[serde(default)]
    pub stats: TestRunStatistics,
    pub is_canceled: bool,
    pub is_aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TestRunCompletePayload {
    pub complete: TestRunCompleteArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_tests: Option<TestRunChangedPayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executor_uris: Vec<String>,
}

impl TestRunCompletePayload {
    /// Completion sent when a run died before the engine could report one itself.
    pub fn aborted(error: Option<String>) -> Self {
        Self {
            complete: TestRunCompleteArgs {
                is_aborted: true,
                error,
                ..TestRunCompleteArgs::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestMessageLevel {
    Informational,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestMessagePayload {
    pub level: TestMessageLevel,
    pub message: String,
}

/// Process the controller should launch with a debugger attached.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TestProcessStartInfo {
    pub file_name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LaunchDebuggeeRequest {
    pub call_id: String,
    pub start_info: TestProcessStartInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LaunchDebuggeeAck {
    /// Absent when the peer predates correlated calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub process_id: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttachDebuggerRequest {
    pub call_id: String,
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_framework: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttachDebuggerAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub attached: bool,
}

fn default_event_frequency() -> usize {
    10
}

fn default_stats_timeout_ms() -> u64 {
    1_500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for t in MessageType::ALL {
            assert!(seen.insert(t.as_str()), "duplicate tag {}", t.as_str());
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn empty_frames_are_built_from_the_crate_root() {
        let bytes = crate::serialize_empty(MessageType::SessionEnd, 5).unwrap();
        let message = crate::deserialize(&bytes).unwrap();
        assert_eq!(message.kind(), Some(MessageType::SessionEnd));
        assert_eq!(message.version, 5);
        assert!(message.payload.is_null());
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        assert_eq!(MessageType::parse("TestSession.FutureThing"), None);
    }

    #[test]
    fn test_case_id_is_stable_per_source_and_name() {
        let a = TestCase::new("suite.one", "executor://x", "/bin/one");
        let b = TestCase::new("suite.one", "executor://x", "/bin/one");
        let c = TestCase::new("suite.one", "executor://x", "/bin/two");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.display_name, "suite.one");
    }

    #[test]
    fn statistics_record_counts_per_outcome() {
        let mut stats = TestRunStatistics::default();
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Failed);
        assert_eq!(stats.executed_tests, 3);
        assert_eq!(stats.count(TestOutcome::Passed), 2);
        assert_eq!(stats.count(TestOutcome::Failed), 1);
        assert_eq!(stats.count(TestOutcome::Skipped), 0);
    }

    #[test]
    fn criteria_defaults_apply_to_minimal_json() {
        let json = r#"{"adapter_source_map":{"_none_":["a.bin"]}}"#;
        let criteria: DiscoveryCriteria = serde_json::from_str(json).unwrap();
        assert_eq!(criteria.frequency_of_discovered_tests_event, 10);
        assert!(criteria.run_settings.is_empty());

        let json = r#"{"tests":[]}"#;
        let criteria: TestRunCriteriaWithTests = serde_json::from_str(json).unwrap();
        assert_eq!(
            criteria.test_execution_context.run_stats_change_event_timeout_ms,
            1_500
        );
    }

    #[test]
    fn ack_without_call_id_decodes() {
        let ack: AttachDebuggerAck = serde_json::from_str(r#"{"attached":true}"#).unwrap();
        assert_eq!(ack.call_id, None);
        assert!(ack.attached);
    }

    #[test]
    fn aborted_run_completion_carries_error() {
        let payload = TestRunCompletePayload::aborted(Some("boom".to_string()));
        assert!(payload.complete.is_aborted);
        assert!(!payload.complete.is_canceled);
        assert_eq!(payload.complete.error.as_deref(), Some("boom"));
    }
}
