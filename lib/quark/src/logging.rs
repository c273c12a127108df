pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the default terminal logger used when the embedding application
/// does not supply its own drain.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .unwrap();

    config.build_logger().unwrap()
}

/// Logger that swallows everything; handed to components constructed without
/// an explicit parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
