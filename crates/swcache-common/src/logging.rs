//! Tracing subscriber setup for SwCache binaries.

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Dependencies that flood the output below `warn`.
const QUIET_DEPENDENCIES: &[&str] = &[
    "hyper=warn",
    "hyper_util=warn",
    "reqwest=warn",
    "rustls=warn",
];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, for a terminal.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON for log shippers.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when neither `filter` nor `RUST_LOG` is set.
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line on every event.
    pub include_location: bool,
    /// Emit span enter/exit events.
    pub include_span_events: bool,
    /// Overrides `RUST_LOG` and `level` (e.g. "swcache_sw=trace,info").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// `debug` level with locations and span events when `verbose`, the default otherwise.
    pub fn verbose(verbose: bool) -> Self {
        if !verbose {
            return Self::default();
        }
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let explicit = match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).ok(),
            None => EnvFilter::try_from_default_env().ok(),
        };
        explicit.unwrap_or_else(|| {
            QUIET_DEPENDENCIES
                .iter()
                .filter_map(|d| d.parse().ok())
                .fold(EnvFilter::new(self.level.to_string()), EnvFilter::add_directive)
        })
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already installed,
/// in which case the existing subscriber is kept.
pub fn init_logging(config: LogConfig) -> bool {
    let installed = tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init();

    match installed {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Logging already initialized");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_quiet() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_verbose() {
        let config = LogConfig::verbose(true);
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_location);
        assert_eq!(LogConfig::verbose(false).level, Level::INFO);
    }

    #[test]
    fn test_builders() {
        let config = LogConfig::default()
            .with_format(LogFormat::Json)
            .with_filter("swcache_sw=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter.as_deref(), Some("swcache_sw=debug"));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }

    #[test]
    fn test_init_logging_only_once() {
        init_logging(LogConfig::default().with_filter("off"));
        assert!(!init_logging(LogConfig::default().with_filter("off")));
    }
}
