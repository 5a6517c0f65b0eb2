//! Time-window validation: is `[start, end)` an acceptable request for this amenity?
//!
//! Pure over its inputs. Checks run in a fixed order and the first failure wins,
//! so callers always see the most specific reason:
//!
//! 1. amenity active
//! 2. both instants parse
//! 3. operating hours, compared in building-local minutes of the start day
//! 4. duration within `max_duration_minutes`
//! 5. `start < end`

use crate::civil::{minutes_of_day, parse_instant, BuildingZone};
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::EngineError;

const DAY_MINUTES: i64 = 24 * 60;

pub fn validate_window(
    amenity: &Amenity,
    zone: &BuildingZone,
    start: &str,
    end: &str,
) -> Result<Span, EngineError> {
    if !amenity.is_active {
        return Err(EngineError::AmenityInactive(amenity.name.clone()));
    }

    let start = parse_bounded(start)?;
    let end = parse_bounded(end)?;

    if let Some(hours) = &amenity.hours {
        check_operating_hours(hours, zone, start, end)?;
    }

    let max_ms = Ms::from(amenity.max_duration_minutes) * MINUTE_MS;
    if end - start > max_ms {
        return Err(EngineError::ExceedsMaxDuration(amenity.max_duration_minutes));
    }

    if start >= end {
        return Err(EngineError::InvalidInterval);
    }

    Ok(Span::new(start, end))
}

fn parse_bounded(raw: &str) -> Result<Ms, EngineError> {
    match parse_instant(raw) {
        Some(t) if (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) => Ok(t),
        _ => Err(EngineError::InvalidTimeFormat(raw.to_string())),
    }
}

/// Both ends are measured from local midnight of the start day, so a window that
/// runs past midnight lands beyond 1440 and fails any same-day close. Hours whose
/// close is not after open (e.g. 22:00 to 02:00) close on the following day.
fn check_operating_hours(
    hours: &OperatingHours,
    zone: &BuildingZone,
    start: Ms,
    end: Ms,
) -> Result<(), EngineError> {
    let day = zone.local_day(start);
    let start_min = zone.minutes_since_midnight(day, start);
    let end_min = zone.minutes_since_midnight(day, end);

    let open = minutes_of_day(hours.open);
    let mut close = minutes_of_day(hours.close);
    if close <= open {
        close += DAY_MINUTES;
    }

    if open <= start_min && end_min <= close {
        Ok(())
    } else {
        Err(EngineError::OutsideOperatingHours {
            open: hours.open.format("%H:%M").to_string(),
            close: hours.close.format("%H:%M").to_string(),
        })
    }
}
