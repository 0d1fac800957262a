use crate::model::Ms;

pub const MAX_INSTRUMENTS: usize = 10_000;
pub const MAX_BOOKINGS_PER_INSTRUMENT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 512;
pub const MAX_DETAILS_LEN: usize = 16 * 1024;
pub const MAX_COMMENT_LEN: usize = 4 * 1024;
pub const MAX_COMMENTS_PER_BOOKING: usize = 1_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Upper bound for one bulk delay (one week).
pub const MAX_DELAY_MINUTES: i64 = 7 * 24 * 60;
