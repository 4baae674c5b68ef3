use crate::model::Ms;

pub const MAX_VEHICLES: usize = 10_000;
pub const MAX_BOOKINGS_PER_VEHICLE: usize = 100_000;
pub const MAX_GROUP_MEMBERS: usize = 64;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Availability queries are capped at 90 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 90 * 24 * 3_600_000;

pub const MAX_SUGGESTIONS: usize = 20;
pub const MAX_ESTIMATED_USAGE_KM: f64 = 10_000.0;
