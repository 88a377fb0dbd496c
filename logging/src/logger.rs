use crate::errors::LoggingError;
use configs::{AppConfigs, Environment};
use tracing::warn;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{
        format::{Format, Pretty},
        Layer,
    },
    layer::SubscriberExt,
};

/// Crates of the AMQP client stack, capped at WARN unless external logging is enabled.
const AMQP_STACK_TARGETS: [&str; 6] = [
    "lapin",
    "amq_protocol",
    "async_io",
    "polling",
    "mio",
    "log",
];

/// Installs the global subscriber: pretty output locally, Bunyan JSON in every other stage.
/// lapin logs through the `log` facade, so its records are bridged first.
pub fn setup(cfg: &AppConfigs) -> Result<(), LoggingError> {
    if let Err(err) = LogTracer::init() {
        warn!(
            error = err.to_string(),
            "log bridge already installed, keeping the existing one"
        );
    }

    let (fmt_pretty, fmt_json): (Option<Layer<_, Pretty, Format<Pretty>>>, _) =
        match cfg.env {
            Environment::Local => (Some(Layer::new().pretty()), None),
            _ => (
                None,
                Some(BunyanFormattingLayer::new(cfg.name.to_owned(), std::io::stdout)),
            ),
        };

    match tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(fmt_json)
            .with(fmt_pretty)
            .with(targets(cfg)),
    ) {
        Err(err) => {
            warn!(error = err.to_string(), "failure to set tracing subscribe");
            Err(LoggingError::SubscriberError {})
        }
        _ => Ok(()),
    }
}

fn targets(cfg: &AppConfigs) -> Targets {
    let filter = Targets::new().with_default(log_level(&cfg.log_level));
    if cfg.enable_external_crates_logging {
        return filter;
    }

    filter.with_targets(
        AMQP_STACK_TARGETS
            .into_iter()
            .map(|target| (target, LevelFilter::WARN)),
    )
}

fn log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn setup_only_once() {
        let first = setup(&AppConfigs::default());
        let second = setup(&AppConfigs::default());

        assert!(first.is_ok());
        assert_eq!(second, Err(LoggingError::SubscriberError));
    }

    #[test]
    fn should_parse_log_level_ignoring_case() {
        for (raw, expected) in [
            ("trace", LevelFilter::TRACE),
            ("Debug", LevelFilter::DEBUG),
            ("INFO", LevelFilter::INFO),
            ("warn", LevelFilter::WARN),
            ("Error", LevelFilter::ERROR),
            ("verbose", LevelFilter::OFF),
            ("", LevelFilter::OFF),
        ] {
            assert_eq!(log_level(raw), expected, "level {raw:?}");
        }
    }

    #[test]
    fn should_quiet_the_amqp_stack_by_default() {
        let cfg = AppConfigs {
            log_level: "debug".to_owned(),
            enable_external_crates_logging: false,
            ..AppConfigs::default()
        };

        let filter = targets(&cfg);

        assert!(filter.would_enable("rabbitmq", &Level::DEBUG));
        assert!(!filter.would_enable("lapin::channel", &Level::DEBUG));
        assert!(!filter.would_enable("amq_protocol", &Level::INFO));
        assert!(filter.would_enable("lapin", &Level::WARN));
    }

    #[test]
    fn should_let_the_amqp_stack_through_when_enabled() {
        let cfg = AppConfigs {
            log_level: "debug".to_owned(),
            enable_external_crates_logging: true,
            ..AppConfigs::default()
        };

        assert!(targets(&cfg).would_enable("lapin::channel", &Level::DEBUG));
    }
}
