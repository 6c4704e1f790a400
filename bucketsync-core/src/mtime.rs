use std::time::SystemTime;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Custom metadata key carrying a file's own modification time.
pub const ORIGINAL_MTIME_KEY: &str = "original-mtime";

/// Drops everything below one millisecond; all freshness comparisons happen at this precision.
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let millis = value.millisecond();
    value
        .replace_nanosecond(u32::from(millis) * 1_000_000)
        .unwrap_or(value)
}

pub fn from_system_time(value: SystemTime) -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::from(value))
}

/// `2024-01-01T00:00:00.000Z`
pub fn format_original_mtime(value: OffsetDateTime) -> String {
    let utc = truncate_to_millis(value).to_offset(UtcOffset::UTC);
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    match utc.format(&format) {
        Ok(text) => text,
        // Only years outside 0..=9999 land here.
        Err(_) => utc.format(&Rfc3339).unwrap_or_default(),
    }
}

pub fn parse_original_mtime(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .ok()
        .map(truncate_to_millis)
}
