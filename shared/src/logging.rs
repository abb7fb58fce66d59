//! Shared logging utilities for consistent tracing setup
//!
//! The supervisor and its embedding host initialize one stdout subscriber.
//! The level comes from an explicit argument when given, otherwise from
//! `RUST_LOG`, otherwise `info`.

use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with an optional explicit log level.
///
/// Priority: explicit argument > `RUST_LOG` env var > `info`.
pub fn init_tracing_with_level(log_level: Option<&str>) {
    let level_filter = if let Some(level) = log_level {
        level.to_string()
    } else {
        EnvFilter::try_from_default_env()
            .map(|f| f.to_string())
            .unwrap_or_else(|_| "info".to_string())
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&level_filter))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Initialize tracing with defaults.
pub fn init_tracing() {
    init_tracing_with_level(None);
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp_has_millis() {
        let stamp = format_timestamp();
        // HH:MM:SS.mmm
        assert_eq!(stamp.len(), 12);
        assert_eq!(&stamp[8..9], ".");
    }
}
