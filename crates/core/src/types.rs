/// Short opaque job identifier (8 lowercase hex characters).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
