use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_RESERVATIONS_PER_AMENITY: usize = 250_000;
pub const MAX_REASON_LEN: usize = 500;
/// Range queries may span at most a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
pub const MAX_AMENITY_NAME_LEN: usize = 200;
/// Pending side effects before the outbox starts dropping.
pub const OUTBOX_CAPACITY: usize = 4096;
