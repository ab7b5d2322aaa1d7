use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Per-target directives (`info,serimux_engine::reactor=trace`) that replace
/// `--log-level` when set.
pub const LOG_ENV: &str = "SERIMUX_LOG";

/// Target of the per-unit serial traffic dump.
const TRAFFIC_TARGET: &str = "serimux_engine::serial";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Debug everywhere, plus a dump of every framed unit crossing the serial link.
    Trace,
}

impl LogLevel {
    pub fn targets(self) -> Targets {
        match self {
            LogLevel::Error => Targets::new().with_default(LevelFilter::ERROR),
            LogLevel::Warn => Targets::new().with_default(LevelFilter::WARN),
            LogLevel::Info => Targets::new().with_default(LevelFilter::INFO),
            LogLevel::Debug => Targets::new().with_default(LevelFilter::DEBUG),
            LogLevel::Trace => Targets::new()
                .with_default(LevelFilter::DEBUG)
                .with_target(TRAFFIC_TARGET, LevelFilter::TRACE),
        }
    }
}

/// Filter from `SERIMUX_LOG` when it holds valid directives, else from `level`.
/// The second value carries the rejected directives, if any.
fn select_filter(level: LogLevel, directives: Option<&str>) -> (Targets, Option<String>) {
    match directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(text) => match text.parse::<Targets>() {
            Ok(targets) => (targets, None),
            Err(_) => (level.targets(), Some(text.to_string())),
        },
        None => (level.targets(), None),
    }
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let env = std::env::var(LOG_ENV).ok();
    let (filter, rejected) = select_filter(level, env.as_deref());
    let with_target = env.is_some() && rejected.is_none();

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::TRACE)
        .with_ansi(false)
        .with_target(with_target);

    let initialized = match format {
        LogFormat::Text => builder.finish().with(filter).try_init(),
        LogFormat::Json => builder.json().finish().with(filter).try_init(),
    };

    if let (Ok(()), Some(text)) = (initialized, rejected) {
        tracing::warn!(directives = %text, "ignoring invalid {LOG_ENV}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn trace_level_enables_only_the_traffic_dump() {
        let targets = LogLevel::Trace.targets();
        assert!(targets.would_enable(TRAFFIC_TARGET, &Level::TRACE));
        assert!(!targets.would_enable("serimux_engine::reactor", &Level::TRACE));
        assert!(targets.would_enable("serimux_engine::reactor", &Level::DEBUG));
    }

    #[test]
    fn levels_map_to_default_filter() {
        let targets = LogLevel::Warn.targets();
        assert!(targets.would_enable("serimux", &Level::WARN));
        assert!(!targets.would_enable("serimux", &Level::INFO));
    }

    #[test]
    fn env_directives_override_flag() {
        let (targets, rejected) =
            select_filter(LogLevel::Error, Some("info,serimux_engine::handler=trace"));
        assert!(rejected.is_none());
        assert!(targets.would_enable("serimux_engine::handler", &Level::TRACE));
        assert!(targets.would_enable("serimux", &Level::INFO));
        assert!(!targets.would_enable("serimux", &Level::DEBUG));
    }

    #[test]
    fn invalid_or_blank_directives_fall_back_to_flag() {
        let (targets, rejected) = select_filter(LogLevel::Info, Some("serimux=loud"));
        assert_eq!(rejected.as_deref(), Some("serimux=loud"));
        assert!(targets.would_enable("serimux", &Level::INFO));
        assert!(!targets.would_enable("serimux", &Level::DEBUG));

        let (_, rejected) = select_filter(LogLevel::Info, Some("  "));
        assert!(rejected.is_none());
    }
}
