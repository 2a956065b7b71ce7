use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

fn filter() -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("testplane=info".parse()?)
        .add_directive("libtestplane=info".parse()?))
}

/// Log to stderr, or append to `diagnostics_log` when one is given.
pub fn init(diagnostics_log: Option<&Path>) -> anyhow::Result<()> {
    let filter = filter()?;
    match diagnostics_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open diagnostics log {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
