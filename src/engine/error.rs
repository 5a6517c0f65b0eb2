use ulid::Ulid;

use crate::model::ReservationStatus;

/// Coarse classification used by the front end to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    NotFound,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    AmenityNotFound(Ulid),
    ReservationNotFound(Ulid),
    AlreadyExists(Ulid),
    AmenityInactive(String),
    InvalidTimeFormat(String),
    OutsideOperatingHours { open: String, close: String },
    ExceedsMaxDuration(u32),
    InvalidInterval,
    UserTimeConflict(Ulid),
    DuplicateDailyBooking(Ulid),
    CapacityExceeded(u32),
    Forbidden(&'static str),
    InvalidStateTransition {
        action: &'static str,
        current: ReservationStatus,
    },
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::AmenityInactive(_)
            | EngineError::InvalidTimeFormat(_)
            | EngineError::OutsideOperatingHours { .. }
            | EngineError::ExceedsMaxDuration(_)
            | EngineError::InvalidInterval
            | EngineError::LimitExceeded(_) => ErrorKind::BadRequest,
            EngineError::AlreadyExists(_)
            | EngineError::UserTimeConflict(_)
            | EngineError::DuplicateDailyBooking(_)
            | EngineError::CapacityExceeded(_)
            | EngineError::InvalidStateTransition { .. } => ErrorKind::Conflict,
            EngineError::AmenityNotFound(_) | EngineError::ReservationNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::StoreUnavailable(_) => ErrorKind::Internal,
        }
    }

    /// Stable short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::AmenityNotFound(_) => "amenity_not_found",
            EngineError::ReservationNotFound(_) => "reservation_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::AmenityInactive(_) => "amenity_inactive",
            EngineError::InvalidTimeFormat(_) => "invalid_time_format",
            EngineError::OutsideOperatingHours { .. } => "outside_operating_hours",
            EngineError::ExceedsMaxDuration(_) => "exceeds_max_duration",
            EngineError::InvalidInterval => "invalid_interval",
            EngineError::UserTimeConflict(_) => "user_time_conflict",
            EngineError::DuplicateDailyBooking(_) => "duplicate_daily_booking",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidStateTransition { .. } => "invalid_state_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::AmenityNotFound(id) => write!(f, "amenity not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "reservation already exists: {id}"),
            EngineError::AmenityInactive(name) => {
                write!(f, "{name} is not available for reservations")
            }
            EngineError::InvalidTimeFormat(raw) => {
                write!(f, "invalid time format: {raw:?} (expected RFC 3339 or Unix milliseconds)")
            }
            EngineError::OutsideOperatingHours { open, close } => write!(
                f,
                "requested time is outside operating hours ({open} to {close})"
            ),
            EngineError::ExceedsMaxDuration(max) => {
                write!(f, "reservation exceeds the maximum duration of {max} minutes")
            }
            EngineError::InvalidInterval => write!(f, "start time must be before end time"),
            EngineError::UserTimeConflict(other) => write!(
                f,
                "you already have a confirmed reservation at this time ({other})"
            ),
            EngineError::DuplicateDailyBooking(other) => write!(
                f,
                "you already have a confirmed reservation for this amenity on this day ({other})"
            ),
            EngineError::CapacityExceeded(cap) => write!(
                f,
                "capacity exceeded: all {cap} slots are taken for the requested time"
            ),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidStateTransition { action, current } => write!(
                f,
                "cannot {action} reservation: current status is {current}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "internal error: store unavailable ({e})"),
        }
    }
}

impl std::error::Error for EngineError {}
