//! Worker output line classification
//!
//! Three line shapes are recognized, in order: bootstrap protocol markers,
//! structured log lines in the `YYYY-MM-DD HH:MM:SS,mmm - logger - LEVEL -
//! message` format, and plain text. Classification is total; a structured
//! line that fails to parse falls back to plain text.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use shared::{LogLevel, LogRecord, LogSource};

const BOOTSTRAP_PREFIX: &str = "BOOTSTRAP_STATUS: ";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";
const TIMESTAMP_WIDTH: usize = 23;
const FIELD_SEPARATOR: &str = " - ";

/// Classifies one line of worker output into a log record.
pub fn parse_line(line: &str, source: LogSource) -> LogRecord {
    if let Some(status) = line.strip_prefix(BOOTSTRAP_PREFIX) {
        let mut metadata = HashMap::new();
        metadata.insert("bootstrap_status".to_string(), status.to_string());
        return LogRecord::new(
            Utc::now(),
            LogLevel::Info,
            format!("Bootstrap status: {}", status),
            source,
            metadata,
        );
    }

    if let Some(record) = parse_structured(line, source) {
        return record;
    }

    LogRecord::plain(line, source)
}

/// Attempts the structured format; `None` means fall back to plain text.
fn parse_structured(line: &str, source: LogSource) -> Option<LogRecord> {
    let stamp = line.get(..TIMESTAMP_WIDTH)?;
    let rest = line.get(TIMESTAMP_WIDTH..)?;

    let timestamp = parse_timestamp(stamp)?;
    let rest = rest.strip_prefix(FIELD_SEPARATOR)?;
    let (logger, rest) = rest.split_once(FIELD_SEPARATOR)?;
    let (level_name, message) = rest.split_once(FIELD_SEPARATOR)?;

    if level_name.is_empty()
        || !level_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }

    let mut metadata = HashMap::new();
    metadata.insert("logger".to_string(), logger.trim().to_string());

    Some(LogRecord::new(
        timestamp,
        LogLevel::from_worker_name(level_name),
        message,
        source,
        metadata,
    ))
}

/// Parses the `2024-01-01 12:00:00,123` stamp, interpreted as UTC.
fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
