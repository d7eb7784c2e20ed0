//! Structured logging setup
//!
//! Helpers for embedding code to install a tracing subscriber matching
//! the configured level and format. The engine itself only emits
//! `tracing` events; installing a subscriber is the host's choice.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSettings};

/// Build filter directives string from LoggingSettings.
///
/// The `COHORT_LOG` environment variable, when set, wins over the
/// configured level.
pub fn build_filter_directives(config: &LoggingSettings) -> String {
    config.level.clone()
}

/// Initialize tracing based on configuration.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = build_filter_directives(config);
    let env_filter =
        EnvFilter::try_from_env("COHORT_LOG").unwrap_or_else(|_| EnvFilter::new(&filter_str));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_use_configured_level() {
        let config = LoggingSettings {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
        };
        assert_eq!(build_filter_directives(&config), "debug");
    }
}
