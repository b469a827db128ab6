//! Thin logging facade so the rest of the crate only depends on one place
//! for logger construction.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Build the default terminal logger used by the server binary and tests
/// that want visible output.
pub fn default_logger() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("Invalid built-in logging configuration");

    config.build_logger().expect("Error building the logger")
}

/// A logger that drops everything. Components constructed without a parent
/// logger use this.
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// Derive a child logger from an optional parent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => null_logger(),
    }
}
