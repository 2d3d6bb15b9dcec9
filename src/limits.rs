//! Hard limits on caller-supplied input. Anything outside these bounds is
//! rejected as `InvalidInput` before any side effect.

use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not exceed one day.
pub const MAX_BOOKING_DURATION_MS: Ms = DAY_MS;

/// Search windows are bounded so a free interval never crosses more than
/// one local day boundary.
pub const MAX_SEARCH_WINDOW_MS: Ms = DAY_MS;

pub const MAX_PARTICIPANTS: u32 = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_MANAGERS: usize = 32;

pub const MAX_CITIES_PER_SEARCH: usize = 32;
pub const MAX_BUSINESSES_PER_CITY: usize = 200;
pub const MAX_SLOTS_PER_SCHEDULE: usize = 50;
pub const MAX_SEARCH_RESULTS: usize = 1_000;

/// Upper bound on `limit` for any collaborator `search` call.
pub const MAX_PAGE_SIZE: usize = 1_000;
