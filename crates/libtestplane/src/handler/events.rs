use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use testplane_protocol::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestProcessStartInfo,
    TestRunChangedPayload, TestRunCompletePayload,
};

use super::TestRequestHandler;
use crate::engine::{DiscoveryEventsHandler, RunEventsHandler};
use crate::error::HandlerError;

/// Engine-facing callbacks that forward to the controller.
///
/// Engines run on blocking threads, so the debugger calls block on the
/// runtime until the controller acknowledges.
pub struct HostEvents {
    handler: Arc<TestRequestHandler>,
    runtime: Handle,
}

impl HostEvents {
    pub(super) fn new(handler: Arc<TestRequestHandler>, runtime: Handle) -> Self {
        Self { handler, runtime }
    }

    fn log(&self, level: TestMessageLevel, message: &str) {
        if let Err(e) = self.handler.send_log(level, message) {
            warn!(error = %e, "failed to forward log message");
        }
    }
}

impl DiscoveryEventsHandler for HostEvents {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        if let Err(e) = self.handler.send_test_cases(tests) {
            warn!(error = %e, "failed to send discovered tests");
        }
    }

    fn handle_discovery_complete(&self, complete: DiscoveryCompletePayload) {
        if let Err(e) = self.handler.discovery_complete(complete) {
            warn!(error = %e, "failed to send discovery completion");
        }
    }

    fn handle_log(&self, level: TestMessageLevel, message: &str) {
        self.log(level, message);
    }
}

impl RunEventsHandler for HostEvents {
    fn handle_test_run_stats_change(&self, change: TestRunChangedPayload) {
        if let Err(e) = self.handler.send_test_run_statistics(change) {
            warn!(error = %e, "failed to send run statistics");
        }
    }

    fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
        if let Err(e) = self.handler.send_execution_complete(complete) {
            warn!(error = %e, "failed to send run completion");
        }
    }

    fn handle_log(&self, level: TestMessageLevel, message: &str) {
        self.log(level, message);
    }

    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, HandlerError> {
        self.runtime.block_on(
            self.handler
                .launch_process_with_debugger_attached(start_info),
        )
    }

    fn attach_debugger(
        &self,
        process_id: u32,
        target_framework: Option<String>,
    ) -> Result<bool, HandlerError> {
        self.runtime
            .block_on(self.handler.attach_debugger(process_id, target_framework))
    }
}
