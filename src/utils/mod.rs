// Shared utilities: log/output redaction, file sampling heuristics, and
// context budgeting for tool responses.

pub mod context;
pub mod file;
pub mod security;

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current Unix timestamp in milliseconds.
pub fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
