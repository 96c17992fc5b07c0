//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// One JSON object per line, for log shippers.
    Json,
    #[default]
    Pretty,
}

/// Initialize tracing for the process. `RUST_LOG` filters; default `info`.
pub fn init(output: LogOutput) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match output {
        LogOutput::Json => builder.json().try_init(),
        LogOutput::Pretty => builder.pretty().try_init(),
    };
}
