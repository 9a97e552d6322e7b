use std::sync::OnceLock;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt,
};

const LOG_FORMAT_ENV: &str = "RUSTPYPI_LOG_FORMAT";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    /// Unknown values fall back to `pretty`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self {
            Self::Json => fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            Self::Compact => fmt::layer()
                .compact()
                .with_target(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            Self::Pretty => fmt::layer()
                .pretty()
                .with_target(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingSettings {
    pub filter: String,
    pub log_format: LogFormat,
}

fn default_filter(level: &str) -> String {
    format!("rustpypi={level}")
}

/// Installs the global subscriber once; later calls only report settings.
pub fn init_from_env(default_level: &str) -> TracingSettings {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_filter(default_level));
    let log_format = LogFormat::from_env();

    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_new(&filter)
            .unwrap_or_else(|_| EnvFilter::new(default_filter("info")));
        // the fmt layer sits directly on the registry; filters wrap the stack
        tracing_subscriber::registry()
            .with(log_format.layer())
            .with(tracing_error::ErrorLayer::default())
            .with(env_filter)
            .init();
    });

    TracingSettings { filter, log_format }
}

#[cfg(test)]
mod tests {
    use super::{LogFormat, default_filter};

    #[test]
    fn log_format_parsing_is_lenient() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" compact "), LogFormat::Compact);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("fancy"), LogFormat::Pretty);
    }

    #[test]
    fn default_filter_targets_this_crate() {
        assert_eq!(default_filter("debug"), "rustpypi=debug");
    }
}
