use tracing::Level;

use crate::core::config::{LogFormat, LoggingConfig};

/// Installs the global fmt subscriber. Call once, before anything logs.
pub fn init_tracing(config: &LoggingConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE);

    match config.format {
        LogFormat::Console => builder.with_ansi(true).init(),
        LogFormat::Json => builder.json().with_ansi(false).init(),
    }
}
