use crate::model::Ms;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_PLATE_LEN: usize = 16;

/// Sensor log entries kept in memory per facility; older ones survive only in the WAL.
pub const MAX_SENSOR_LOG_PER_FACILITY: usize = 10_000;

pub const MAX_ROWS_PER_QUERY: usize = 10_000;

/// How many times a writer re-resolves locks when a record moved between lookup and lock.
pub const MAX_LOCK_RETRIES: usize = 8;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

pub const DEFAULT_MIN_LEAD_MINUTES: i64 = 5;
pub const DEFAULT_MIN_DURATION_MINUTES: i64 = 30;
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 24 * 60;
