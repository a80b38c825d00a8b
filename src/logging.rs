// Tracing setup
use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so stdout carries only reports and summaries.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| anyhow::Error::msg(format!("invalid log level {:?}: {}", level, e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::Error::msg(format!("logging init error: {}", e)))?;
    Ok(())
}
