//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Build the filter: `RUST_LOG` wins, then the configured level, then `info`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.trim()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable. Calling this twice is harmless.
pub fn init(logging: &LoggingSection) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&logging.level))
        .with_target(true)
        .with_writer(std::io::stderr);
    let result = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_falls_back() {
        // Never panics, whatever the level string.
        let _ = env_filter("not a level ===");
        let _ = env_filter("debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let logging = LoggingSection::default();
        init(&logging);
        init(&LoggingSection {
            format: LogFormat::Json,
            ..logging
        });
    }
}
