//! Built-in engine: every test source is an executable, and the executable's
//! exit status is the test outcome.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use libtestplane::engine::{
    DiscoveryEngine, DiscoveryEventsHandler, ExecutionEngine, RunEventsHandler, RunRequest,
    TestCaseEventsHandler, TestRun,
};
use libtestplane::error::EngineError;
use testplane_protocol::{
    AdapterSourceMap, DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestMessageLevel,
    TestOutcome, TestResult, TestRunChangedPayload, TestRunCompleteArgs, TestRunCompletePayload,
    TestRunStatistics,
};

pub const EXECUTOR_URI: &str = "executor://testplane/process";

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Abort,
}

#[derive(Default)]
struct EngineState {
    extension_paths: Vec<String>,
    running: bool,
    interrupt: Option<Interrupt>,
    /// The running test process. It is only reaped while the state lock is
    /// held, so a kill never reaches a pid the OS has handed out again.
    current: Option<Child>,
}

#[derive(Default)]
pub struct ProcessEngine {
    state: Mutex<EngineState>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_extensions(&self, extension_paths: &[String]) {
        if !extension_paths.is_empty() {
            debug!(count = extension_paths.len(), "extensions registered");
        }
        self.lock()
            .extension_paths
            .extend(extension_paths.iter().cloned());
    }

    fn interrupt(&self, kind: Interrupt) -> bool {
        let mut state = self.lock();
        state.interrupt = Some(kind);
        if let Some(child) = state.current.as_mut() {
            info!(pid = child.id(), ?kind, "killing running test");
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), error = %e, "failed to kill running test");
            }
        }
        state.running
    }

    /// Wait for the current test process to exit. Returns its status and
    /// whether the run was interrupted meanwhile.
    fn wait_current(&self) -> io::Result<(ExitStatus, bool)> {
        loop {
            {
                let mut state = self.lock();
                let Some(child) = state.current.as_mut() else {
                    return Err(io::Error::other("test process is no longer tracked"));
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        state.current = None;
                        return Ok((status, state.interrupt.is_some()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(mut child) = state.current.take() {
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                        return Err(e);
                    }
                }
            }
            thread::sleep(EXIT_POLL);
        }
    }

    fn execute(&self, test: &TestCase, events: &Arc<dyn RunEventsHandler>, debugging: bool) -> TestResult {
        let started = Instant::now();
        let finish = |outcome: TestOutcome, error_message: Option<String>, messages: Vec<String>| {
            TestResult {
                test_case: test.clone(),
                outcome,
                error_message,
                duration_ms: started.elapsed().as_millis() as u64,
                messages,
            }
        };

        if !Path::new(&test.source).is_file() {
            return finish(
                TestOutcome::NotFound,
                Some(format!("{} does not exist", test.source)),
                Vec::new(),
            );
        }

        let child = Command::new(&test.source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return finish(
                    TestOutcome::Failed,
                    Some(format!("failed to start {}: {e}", test.source)),
                    Vec::new(),
                );
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        self.lock().current = Some(child);
        if debugging {
            match events.attach_debugger(pid, None) {
                Ok(true) => debug!(pid, "debugger attached"),
                Ok(false) => events.handle_log(
                    TestMessageLevel::Warning,
                    &format!("no debugger attached to {}", test.display_name),
                ),
                Err(e) => warn!(pid, error = %e, "attach debugger failed"),
            }
        }
        let waited = self.wait_current();
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        let (status, interrupted) = match waited {
            Ok(waited) => waited,
            Err(e) => {
                return finish(TestOutcome::Failed, Some(format!("wait failed: {e}")), Vec::new());
            }
        };
        let messages = if stdout.is_empty() { Vec::new() } else { vec![stdout] };

        if interrupted {
            return finish(TestOutcome::None, Some("test run was interrupted".to_string()), messages);
        }
        if status.success() {
            finish(TestOutcome::Passed, None, messages)
        } else {
            let error = if stderr.is_empty() {
                format!("exited with {status}")
            } else {
                stderr
            };
            finish(TestOutcome::Failed, Some(error), messages)
        }
    }
}

/// Read a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!(error = %e, "test output pipe closed early");
        }
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

fn test_for_source(source: &str) -> TestCase {
    let name = Path::new(source)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string());
    let mut test = TestCase::new(name.clone(), EXECUTOR_URI, source);
    test.display_name = name;
    test
}

fn tests_for_sources(sources: &AdapterSourceMap, filter: Option<&str>) -> Vec<TestCase> {
    sources
        .values()
        .flatten()
        .map(|source| test_for_source(source))
        .filter(|test| filter.is_none_or(|f| test.fully_qualified_name.contains(f)))
        .collect()
}

impl DiscoveryEngine for ProcessEngine {
    fn initialize(
        &self,
        extension_paths: &[String],
        _events: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<(), EngineError> {
        self.record_extensions(extension_paths);
        Ok(())
    }

    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        events: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<(), EngineError> {
        let chunk = criteria.frequency_of_discovered_tests_event.max(1);
        let mut found = Vec::new();
        let mut total = 0i64;

        for test in tests_for_sources(
            &criteria.adapter_source_map,
            criteria.test_case_filter.as_deref(),
        ) {
            if !Path::new(&test.source).is_file() {
                events.handle_log(
                    TestMessageLevel::Warning,
                    &format!("test source {} was not found", test.source),
                );
                continue;
            }
            total += 1;
            found.push(test);
            if found.len() >= chunk {
                events.handle_discovered_tests(std::mem::take(&mut found));
            }
        }

        info!(total, "discovery finished");
        events.handle_discovery_complete(DiscoveryCompletePayload {
            total_tests: total,
            last_discovered_tests: Some(found),
            is_aborted: false,
        });
        Ok(())
    }
}

impl ExecutionEngine for ProcessEngine {
    fn initialize(
        &self,
        extension_paths: &[String],
        _events: Arc<dyn RunEventsHandler>,
    ) -> Result<(), EngineError> {
        self.record_extensions(extension_paths);
        Ok(())
    }

    fn start_test_run(
        &self,
        run: TestRun,
        test_case_events: Option<Arc<dyn TestCaseEventsHandler>>,
        events: Arc<dyn RunEventsHandler>,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.lock();
            if state.running {
                return Err(EngineError::Failed("a test run is already in progress".to_string()));
            }
            state.running = true;
            state.interrupt = None;
        }

        let context = &run.context;
        let filter = context.test_case_filter.as_deref();
        let tests = match &run.request {
            RunRequest::Sources(sources) => tests_for_sources(sources, filter),
            RunRequest::Tests(tests) => tests.clone(),
        };
        let frequency = context.frequency_of_run_stats_change_event.max(1);
        let stats_timeout = Duration::from_millis(context.run_stats_change_event_timeout_ms);

        let started = Instant::now();
        let mut stats = TestRunStatistics::default();
        let mut pending: Vec<TestResult> = Vec::new();
        let mut last_flush = Instant::now();

        for test in &tests {
            if self.lock().interrupt.is_some() {
                break;
            }
            if let Some(handler) = &test_case_events {
                handler.send_test_case_start(test);
            }
            let result = self.execute(test, &events, context.are_tests_debugging);
            if let Some(handler) = &test_case_events {
                handler.send_test_case_end(test, result.outcome);
                handler.send_test_result(&result);
            }
            stats.record(result.outcome);
            pending.push(result);

            if pending.len() >= frequency || last_flush.elapsed() >= stats_timeout {
                events.handle_test_run_stats_change(TestRunChangedPayload {
                    new_test_results: std::mem::take(&mut pending),
                    stats: stats.clone(),
                    active_tests: Vec::new(),
                });
                last_flush = Instant::now();
            }
        }

        let interrupt = {
            let mut state = self.lock();
            state.running = false;
            state.interrupt
        };
        let last_run_tests = (!pending.is_empty()).then(|| TestRunChangedPayload {
            new_test_results: pending,
            stats: stats.clone(),
            active_tests: Vec::new(),
        });
        info!(
            executed = stats.executed_tests,
            failed = stats.count(TestOutcome::Failed),
            ?interrupt,
            "test run finished"
        );
        events.handle_test_run_complete(TestRunCompletePayload {
            complete: TestRunCompleteArgs {
                stats,
                is_canceled: interrupt == Some(Interrupt::Cancel),
                is_aborted: interrupt == Some(Interrupt::Abort),
                error: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            last_run_tests,
            executor_uris: vec![EXECUTOR_URI.to_string()],
        });
        Ok(())
    }

    fn cancel(&self, _events: Arc<dyn RunEventsHandler>) -> Result<(), EngineError> {
        self.interrupt(Interrupt::Cancel);
        Ok(())
    }

    fn abort(&self, events: Arc<dyn RunEventsHandler>) -> Result<(), EngineError> {
        // A running test run reports its own aborted completion.
        if !self.interrupt(Interrupt::Abort) {
            events.handle_test_run_complete(TestRunCompletePayload::aborted(None));
        }
        Ok(())
    }
}

/// Per-test events for data collection, reported through `tracing`.
pub struct TracingTestCaseEvents;

impl TestCaseEventsHandler for TracingTestCaseEvents {
    fn send_test_case_start(&self, test: &TestCase) {
        debug!(test = %test.fully_qualified_name, "test case started");
    }

    fn send_test_case_end(&self, test: &TestCase, outcome: TestOutcome) {
        debug!(test = %test.fully_qualified_name, ?outcome, "test case finished");
    }

    fn send_test_result(&self, result: &TestResult) {
        debug!(
            test = %result.test_case.fully_qualified_name,
            duration_ms = result.duration_ms,
            "test result recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use libtestplane::error::HandlerError;
    use testplane_protocol::{TestExecutionContext, TestProcessStartInfo};

    #[derive(Default)]
    struct Recorder {
        found: Mutex<Vec<TestCase>>,
        discovery: Mutex<Option<DiscoveryCompletePayload>>,
        changes: Mutex<Vec<TestRunChangedPayload>>,
        complete: Mutex<Option<TestRunCompletePayload>>,
        logs: Mutex<Vec<String>>,
    }

    impl DiscoveryEventsHandler for Recorder {
        fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
            self.found.lock().unwrap().extend(tests);
        }
        fn handle_discovery_complete(&self, complete: DiscoveryCompletePayload) {
            *self.discovery.lock().unwrap() = Some(complete);
        }
        fn handle_log(&self, _level: TestMessageLevel, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }
    }

    impl RunEventsHandler for Recorder {
        fn handle_test_run_stats_change(&self, change: TestRunChangedPayload) {
            self.changes.lock().unwrap().push(change);
        }
        fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
            *self.complete.lock().unwrap() = Some(complete);
        }
        fn handle_log(&self, _level: TestMessageLevel, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }
        fn launch_process_with_debugger_attached(
            &self,
            _start_info: TestProcessStartInfo,
        ) -> Result<i32, HandlerError> {
            Ok(-1)
        }
        fn attach_debugger(
            &self,
            _process_id: u32,
            _target_framework: Option<String>,
        ) -> Result<bool, HandlerError> {
            Ok(false)
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn sources(paths: &[String]) -> AdapterSourceMap {
        let mut map = AdapterSourceMap::new();
        map.insert("_none_".to_string(), paths.to_vec());
        map
    }

    fn run(paths: &[String], frequency: usize) -> TestRun {
        TestRun {
            request: RunRequest::Sources(sources(paths)),
            package: None,
            run_settings: String::new(),
            context: TestExecutionContext {
                frequency_of_run_stats_change_event: frequency,
                ..TestExecutionContext::default()
            },
        }
    }

    #[test]
    fn exit_status_decides_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let pass = script(dir.path(), "pass.sh", "echo hello\nexit 0");
        let fail = script(dir.path(), "fail.sh", "echo boom >&2\nexit 3");
        let missing = dir.path().join("missing.sh").to_string_lossy().into_owned();

        let engine = ProcessEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine
            .start_test_run(run(&[pass, fail, missing], 2), None, recorder.clone())
            .unwrap();

        let changes = recorder.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_test_results.len(), 2);

        let complete = recorder.complete.lock().unwrap().clone().unwrap();
        assert!(!complete.complete.is_aborted);
        assert_eq!(complete.complete.stats.executed_tests, 3);
        assert_eq!(complete.complete.stats.count(TestOutcome::Passed), 1);
        assert_eq!(complete.complete.stats.count(TestOutcome::Failed), 1);
        assert_eq!(complete.complete.stats.count(TestOutcome::NotFound), 1);

        let results: Vec<TestResult> = changes[0]
            .new_test_results
            .iter()
            .cloned()
            .chain(complete.last_run_tests.unwrap().new_test_results)
            .collect();
        assert_eq!(results[0].messages, vec!["hello".to_string()]);
        assert_eq!(results[1].error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn discovery_skips_missing_sources_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<String> = (0..3)
            .map(|i| script(dir.path(), &format!("t{i}.sh"), "exit 0"))
            .collect();
        let mut all = paths.clone();
        all.push("/definitely/not/here".to_string());

        let engine = ProcessEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine
            .discover_tests(
                DiscoveryCriteria {
                    adapter_source_map: sources(&all),
                    frequency_of_discovered_tests_event: 2,
                    ..Default::default()
                },
                recorder.clone(),
            )
            .unwrap();

        assert_eq!(recorder.found.lock().unwrap().len(), 2);
        let complete = recorder.discovery.lock().unwrap().clone().unwrap();
        assert_eq!(complete.total_tests, 3);
        assert_eq!(complete.last_discovered_tests.unwrap().len(), 1);
        assert_eq!(recorder.logs.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_kills_running_test() {
        let dir = tempfile::tempdir().unwrap();
        let slow = script(dir.path(), "slow.sh", "exec sleep 30");
        let next = script(dir.path(), "next.sh", "exit 0");

        let engine = Arc::new(ProcessEngine::new());
        let recorder = Arc::new(Recorder::default());
        let runner = {
            let engine = Arc::clone(&engine);
            let recorder = recorder.clone();
            std::thread::spawn(move || engine.start_test_run(run(&[slow, next], 10), None, recorder))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.lock().current.is_none() {
            assert!(Instant::now() < deadline, "test never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        engine.cancel(recorder.clone()).unwrap();
        runner.join().unwrap().unwrap();

        let complete = recorder.complete.lock().unwrap().clone().unwrap();
        assert!(complete.complete.is_canceled);
        assert_eq!(complete.complete.stats.executed_tests, 1);
        assert_eq!(complete.complete.stats.count(TestOutcome::None), 1);
    }

    #[test]
    fn finished_test_leaves_nothing_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let quick = script(dir.path(), "quick.sh", "echo done\nexit 0");

        let engine = ProcessEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine
            .start_test_run(run(&[quick.clone()], 10), None, recorder.clone())
            .unwrap();
        assert!(engine.lock().current.is_none(), "exited test is no longer tracked");

        // Nothing is running, so the late cancel has no process to signal.
        assert!(!engine.interrupt(Interrupt::Cancel));
        assert!(engine.lock().current.is_none());

        let again = Arc::new(Recorder::default());
        engine.start_test_run(run(&[quick], 10), None, again.clone()).unwrap();
        let complete = again.complete.lock().unwrap().clone().unwrap();
        assert!(!complete.complete.is_canceled);
        assert_eq!(complete.complete.stats.count(TestOutcome::Passed), 1);
        let result = &complete.last_run_tests.unwrap().new_test_results[0];
        assert_eq!(result.messages, vec!["done".to_string()]);
    }

    #[test]
    fn abort_without_run_reports_completion() {
        let engine = ProcessEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine.abort(recorder.clone()).unwrap();
        let complete = recorder.complete.lock().unwrap().clone().unwrap();
        assert!(complete.complete.is_aborted);
    }

    #[test]
    fn filter_narrows_tests() {
        let map = sources(&["/bin/alpha".to_string(), "/bin/beta".to_string()]);
        let tests = tests_for_sources(&map, Some("bet"));
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].display_name, "beta");
    }
}
