//! Logging and tracing utilities

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the log output format
pub const LOG_FORMAT_VAR: &str = "TICKERFLOW_LOG_FORMAT";

/// Output format for the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-field lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is pretty
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    /// Read the format from `TICKERFLOW_LOG_FORMAT`
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_VAR)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing subscriber with default configuration
///
/// The format is taken from `TICKERFLOW_LOG_FORMAT`, the filter from `RUST_LOG`.
pub fn init_tracing() {
    init_tracing_with(LogFormat::from_env());
}

/// Initialize tracing subscriber with an explicit output format
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing_with(format: LogFormat) {
    // Logs go to stderr so stdout stays clean for reports and JSON exports
    let registry = tracing_subscriber::registry().with(default_filter());
    let result = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing_with(LogFormat::Pretty);
        init_tracing_with(LogFormat::Json);
    }
}
