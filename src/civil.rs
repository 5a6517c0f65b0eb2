use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

use crate::model::{Ms, MINUTE_MS};

/// Buenos Aires has observed UTC-03:00 year-round since 2009.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = -180;

/// The building's civil time zone. Operating hours and "same day" are always
/// judged here, never in the server's or the caller's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildingZone {
    offset: FixedOffset,
}

impl Default for BuildingZone {
    fn default() -> Self {
        Self::from_offset_minutes(DEFAULT_UTC_OFFSET_MINUTES).unwrap_or(Self { offset: Utc.fix() })
    }
}

impl BuildingZone {
    /// `None` when the offset is not within ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        let seconds = minutes.checked_mul(60)?;
        FixedOffset::east_opt(seconds).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    /// Building-local wall clock for an instant. Out-of-range instants clamp to the epoch.
    pub fn local(&self, t: Ms) -> DateTime<FixedOffset> {
        DateTime::from_timestamp_millis(t)
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }

    pub fn local_day(&self, t: Ms) -> NaiveDate {
        self.local(t).date_naive()
    }

    /// Whole minutes from local midnight of `day` to `t`. May exceed 1440 or be negative.
    pub fn minutes_since_midnight(&self, day: NaiveDate, t: Ms) -> i64 {
        let midnight = day.and_time(NaiveTime::MIN);
        let midnight_ms = match self.offset.from_local_datetime(&midnight).single() {
            Some(dt) => dt.timestamp_millis(),
            None => midnight.and_utc().timestamp_millis(),
        };
        (t - midnight_ms).div_euclid(MINUTE_MS)
    }

    pub fn format(&self, t: Ms) -> String {
        self.local(t).to_rfc3339()
    }
}

/// Parse a caller-supplied instant: RFC 3339 text (any offset) or Unix milliseconds.
pub fn parse_instant(raw: &str) -> Option<Ms> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ms) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms).map(|dt| dt.timestamp_millis());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

pub fn minutes_of_day(t: NaiveTime) -> i64 {
    use chrono::Timelike;
    i64::from(t.hour()) * 60 + i64::from(t.minute())
}
