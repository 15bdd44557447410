pub mod client;
pub mod server;

use log::LevelFilter;

/// Parse a `--log-level` value. Case-insensitive, so `OFF`, `INFO` and `DEBUG` work too.
pub fn parse_log_level(s: &str) -> Result<LevelFilter, String> {
    s.parse::<LevelFilter>().map_err(|_| {
        format!("unknown log level '{s}' (expected off, error, warn, info, debug or trace)")
    })
}

/// Install the global logger at `level`; `RUST_LOG` wins when set.
pub fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .parse_default_env()
        .init();
}
