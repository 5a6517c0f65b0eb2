use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Confirmed reservations on this amenity overlapping `span`, skipping `exclude`.
pub fn confirmed_overlap_count(ledger: &AmenityLedger, span: &Span, exclude: Option<Ulid>) -> u32 {
    let count = ledger
        .overlapping(span)
        .filter(|r| r.status == ReservationStatus::Confirmed && Some(r.id) != exclude)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

pub fn has_capacity(amenity: &Amenity, ledger: &AmenityLedger, span: &Span, exclude: Option<Ulid>) -> bool {
    confirmed_overlap_count(ledger, span, exclude) < amenity.capacity
}

/// Id of a confirmed reservation (any amenity) the user holds overlapping `span`.
pub fn user_has_overlap(user: &UserLedger, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    user.overlapping(span, exclude).map(|w| w.reservation_id)
}

/// Id of a confirmed reservation the user holds on this amenity on the same local day.
pub fn user_has_same_amenity_same_day(
    user: &UserLedger,
    amenity_id: Ulid,
    day: NaiveDate,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    user.same_amenity_same_day(amenity_id, day, exclude)
        .map(|w| w.reservation_id)
}

/// Conflict half of the admission gate. Order matters: user overlap, then
/// same-day duplicate, then capacity. Both ledgers must be locked by the caller.
pub(crate) fn check_admission(
    amenity: &Amenity,
    ledger: &AmenityLedger,
    user: &UserLedger,
    span: &Span,
    day: NaiveDate,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(other) = user_has_overlap(user, span, exclude) {
        return Err(EngineError::UserTimeConflict(other));
    }
    if let Some(other) = user_has_same_amenity_same_day(user, amenity.id, day, exclude) {
        return Err(EngineError::DuplicateDailyBooking(other));
    }
    if !has_capacity(amenity, ledger, span, exclude) {
        return Err(EngineError::CapacityExceeded(amenity.capacity));
    }
    Ok(())
}
