//! Logging initialization.
//!
//! RUST_LOG takes priority over the config file; the default is info-level
//! pretty output.

use crate::config::LogSection;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the tracing subscriber.
///
/// Priority order:
/// 1. RUST_LOG environment variable (if set)
/// 2. `[log]` section of config.toml (if provided)
/// 3. info level, pretty format
pub fn init_logging(config: Option<&LogSection>) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = config.map(|c| c.level.as_str()).unwrap_or("info");
        EnvFilter::new(normalize_level(level))
    };

    let format = config.map(|c| c.format.as_str()).unwrap_or("pretty");

    match format {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

fn normalize_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
