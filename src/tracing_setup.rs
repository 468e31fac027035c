//! Tracing infrastructure.
//!
//! Structured, async-aware logging for the coordination core, built on
//! `tracing` and `tracing-subscriber`:
//! - environment-based filtering (`RUST_LOG` wins over the configured level)
//! - multiple output formats (pretty, compact, JSON)
//!
//! # Example
//! ```no_run
//! use lab_coord::{config::CoordConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("coordination core starting");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::CoordConfig;

/// Output format for tracing.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Initialize tracing from the configured log level.
pub fn init_from_config(config: &CoordConfig) -> Result<(), String> {
    init(&config.log_level, OutputFormat::default())
}

/// Initialize tracing with an explicit level and format.
///
/// `RUST_LOG`, when set, overrides `level`. Fails if a global subscriber is
/// already installed.
pub fn init(level: &str, format: OutputFormat) -> Result<(), String> {
    let level = parse_log_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let builder = fmt().with_env_filter(filter);
    let result = match format {
        OutputFormat::Pretty => builder.pretty().try_init(),
        OutputFormat::Compact => builder.compact().with_ansi(false).try_init(),
        OutputFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| format!("failed to initialize tracing: {e}"))
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "invalid log level '{other}' (expected trace, debug, info, warn or error)"
        )),
    }
}
