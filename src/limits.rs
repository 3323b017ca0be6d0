use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_SITES: usize = 1024;
pub const MAX_SITE_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_SITE: usize = 10_000;
pub const MAX_NUMBER_LEN: usize = 32;
pub const MAX_LANE_NAME_LEN: usize = 32;
pub const MAX_OPEN_WAITLIST: usize = 1_000;

pub const MAX_STAFF_PER_SITE: usize = 1_000;
pub const MAX_STAFF_NAME_LEN: usize = 64;
pub const MIN_PIN_LEN: usize = 4;
pub const MAX_PIN_LEN: usize = 8;
pub const MAX_SHIFT_MS: Ms = 16 * 3_600_000;

pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_LINE_ITEM_CENTS: i64 = 1_000_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
/// Longest configurable block, stay, hold or session.
pub const MAX_POLICY_SPAN_MS: Ms = 366 * DAY_MS;
