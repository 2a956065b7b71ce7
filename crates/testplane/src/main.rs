use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use libtestplane::{SessionCriteria, TestplaneConfig};
use testplane::{Controller, logging};
use testplane_protocol::TestOutcome;

#[derive(Parser)]
#[command(name = "testplane", about = "Discover and run tests in isolated test host processes")]
struct Cli {
    /// Config file (defaults to the per-user config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Test sources (executables)
    #[arg(required = true)]
    sources: Vec<String>,

    /// File whose contents are handed to every test host as run settings
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Maximum number of test hosts
    #[arg(long)]
    workers: Option<usize>,

    /// Test host executable, overriding the config
    #[arg(long)]
    host: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tests found in the given sources
    Discover(SessionArgs),

    /// Run the tests in the given sources
    Run(SessionArgs),
}

impl SessionArgs {
    fn into_criteria(self, config: &mut TestplaneConfig) -> anyhow::Result<SessionCriteria> {
        if let Some(host) = self.host {
            config.host_executable = host;
        }
        let run_settings = match &self.settings {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read run settings {}", path.display()))?,
            None => String::new(),
        };
        Ok(SessionCriteria {
            sources: self.sources,
            run_settings,
            max_worker_count: self.workers,
        })
    }
}

fn outcome_label(outcome: TestOutcome) -> &'static str {
    match outcome {
        TestOutcome::Passed => "PASSED",
        TestOutcome::Failed => "FAILED",
        TestOutcome::Skipped => "SKIPPED",
        TestOutcome::NotFound => "NOT FOUND",
        TestOutcome::None => "NO RESULT",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TestplaneConfig::load_from(path)?,
        None => TestplaneConfig::load()?,
    };
    logging::init(None)?;

    match cli.command {
        Commands::Discover(args) => {
            let criteria = args.into_criteria(&mut config)?;
            let report = Controller::new(config).discover(criteria).await?;
            for test in &report.tests {
                println!("{}  {}", test.fully_qualified_name, test.source);
            }
            println!("{} test(s) found", report.tests.len());
            if report.aborted {
                anyhow::bail!("discovery was aborted");
            }
        }
        Commands::Run(args) => {
            let criteria = args.into_criteria(&mut config)?;
            let report = Controller::new(config).run(criteria).await?;
            for result in &report.results {
                println!(
                    "{:<9}  {} ({} ms)",
                    outcome_label(result.outcome),
                    result.test_case.display_name,
                    result.duration_ms
                );
                if let Some(error) = &result.error_message {
                    println!("           {error}");
                }
            }
            let passed = report.stats.count(TestOutcome::Passed);
            let failed = report.stats.count(TestOutcome::Failed)
                + report.stats.count(TestOutcome::NotFound);
            println!(
                "{} executed, {passed} passed, {failed} failed",
                report.stats.executed_tests
            );
            for error in &report.errors {
                eprintln!("error: {error}");
            }
            if report.aborted {
                anyhow::bail!("test run was aborted");
            }
            if failed > 0 {
                anyhow::bail!("{failed} test(s) failed");
            }
        }
    }
    Ok(())
}
