use chrono::Utc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    filter::FilterFn, fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_fmt(format_args!("{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")))
    }
}

/// Initialise the process-wide tracing subscriber. The level comes from
/// `LOG_LEVEL` (`error`, `warn`, `info`, `debug`, `trace`), defaulting to
/// `info` in release builds and `debug` otherwise.
pub fn init() {
    let level = match std::env::var("LOG_LEVEL") {
        Ok(level) => match level.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        },
        Err(_) => {
            if cfg!(debug_assertions) {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            }
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(Time)
                .with_target(false)
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("ferropost")
                })),
        )
        .init();
}
