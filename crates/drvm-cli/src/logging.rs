use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap_verbosity_flag::{LogLevel, Verbosity};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_directive`.
/// With `log_file` set, output is appended there instead of stderr.
pub fn init_tracing(default_directive: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// `-v`/`-q` as a filter directive, or `None` when neither flag was given.
pub fn verbosity_directive<L: LogLevel>(verbose: &Verbosity<L>) -> Option<String> {
    verbose
        .is_present()
        .then(|| verbose.tracing_level_filter().to_string().to_lowercase())
}
