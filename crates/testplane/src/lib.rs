pub mod controller;
pub mod engine;
pub mod logging;

pub use controller::{Controller, DiscoveryReport, RunReport};
pub use engine::{EXECUTOR_URI, ProcessEngine, TracingTestCaseEvents};
