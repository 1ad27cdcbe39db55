use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize structured logging with tracing.
///
/// Everything goes to stderr: a spawned daemon inherits a stderr redirected
/// into the service's `log` file, so stderr *is* the daemon log, and an
/// interactive run shows the same stream on the terminal.
pub fn init_logger(log_level: &str, log_format: &str, verbose: bool) -> Result<()> {
    // Parse log level
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!("Invalid log level '{log_level}', using 'info'");
            Level::INFO
        }
    };

    // Override with verbose mode
    let actual_level = if verbose { Level::DEBUG } else { level };

    // Create env filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("sockd={actual_level}")))
        .context("Failed to create log filter")?;

    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}
