use chrono::{DateTime, Utc};

/// Second-precision ISO 8601 timestamp, e.g. `2024-05-01T10:00:00Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Whole seconds elapsed since `launched`; negative clock skew counts as zero.
pub fn age_secs(launched: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - launched).num_seconds().max(0) as u64
}

/// Compact human age: "45s", "12m", "3h".
pub fn format_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s => format!("{}h", s / 3600),
    }
}
