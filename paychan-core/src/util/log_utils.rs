use anyhow::{anyhow, Result};
use log;

const LOG_LEVEL_FILTERS: [log::LevelFilter; 6] = [
    log::LevelFilter::Off,
    log::LevelFilter::Error,
    log::LevelFilter::Warn,
    log::LevelFilter::Info,
    log::LevelFilter::Debug,
    log::LevelFilter::Trace,
];

/// Name for each log level
pub const LOG_LEVEL_FILTER_NAMES: [&'static str; 6] =
    ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

/// Parse a log level name to a Level filter, ignoring case
pub fn parse_log_level_filter(lvlstr: &str) -> Result<log::LevelFilter> {
    let upper = lvlstr.trim().to_uppercase();
    Ok(*LOG_LEVEL_FILTERS
        .iter()
        .find(|ll| upper == ll.as_str())
        .ok_or_else(|| anyhow!("invalid log level: {}", lvlstr))?)
}

/// Initialize `env_logger` at the level named by `PAYCHAN_LOG`, or `default` if unset
#[cfg(feature = "env_logger")]
pub fn init_logging(default: log::LevelFilter) -> Result<()> {
    let level = match std::env::var("PAYCHAN_LOG") {
        Ok(s) => parse_log_level_filter(&s)?,
        Err(_) => default,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .try_init()
        .map_err(|e| anyhow!("logger already initialized: {}", e))
}
