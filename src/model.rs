use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Civil (building-local) time only exists at the edges.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Lifecycle state of a reservation. `Cancelled` and `Finalized` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Finalized,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "finalized" => Some(ReservationStatus::Finalized),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Finalized)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily opening window in building-local civil time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    #[serde(with = "hhmm")]
    pub open: NaiveTime,
    #[serde(with = "hhmm")]
    pub close: NaiveTime,
}

/// A bookable shared resource. Owned by the catalog; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amenity {
    pub id: Ulid,
    pub name: String,
    /// Max simultaneously confirmed reservations.
    pub capacity: u32,
    pub max_duration_minutes: u32,
    #[serde(default)]
    pub hours: Option<OperatingHours>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub requires_approval: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub amenity_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub hidden: bool,
    /// Why the reservation was cancelled, when a reason was given.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Resident,
    Admin,
}

/// The authenticated caller. Resolved by the identity collaborator and trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn resident(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Resident }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// WAL record. Every committed state change is exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: Ulid,
        user_id: Ulid,
        amenity_id: Ulid,
        span: Span,
        status: ReservationStatus,
        created_at: Ms,
    },
    StatusChanged {
        id: Ulid,
        amenity_id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
        at: Ms,
    },
    ReservationsFinalized {
        amenity_id: Ulid,
        ids: Vec<Ulid>,
        at: Ms,
    },
    ReservationHidden {
        id: Ulid,
        amenity_id: Ulid,
    },
}

impl Event {
    pub fn amenity_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { amenity_id, .. }
            | Event::StatusChanged { amenity_id, .. }
            | Event::ReservationsFinalized { amenity_id, .. }
            | Event::ReservationHidden { amenity_id, .. } => *amenity_id,
        }
    }
}

/// All reservations ever made on one amenity, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct AmenityLedger {
    pub amenity_id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl AmenityLedger {
    pub fn new(amenity_id: Ulid) -> Self {
        Self {
            amenity_id,
            reservations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Fold one event into the ledger. Events for other amenities are ignored.
    pub fn apply(&mut self, event: &Event) {
        if event.amenity_id() != self.amenity_id {
            return;
        }
        match event {
            Event::ReservationCreated {
                id,
                user_id,
                amenity_id,
                span,
                status,
                created_at,
            } => self.insert(Reservation {
                id: *id,
                user_id: *user_id,
                amenity_id: *amenity_id,
                span: *span,
                status: *status,
                created_at: *created_at,
                updated_at: *created_at,
                hidden: false,
                reason: None,
            }),
            Event::StatusChanged {
                id,
                status,
                reason,
                at,
                ..
            } => {
                if let Some(r) = self.get_mut(id) {
                    r.status = *status;
                    r.updated_at = *at;
                    if reason.is_some() {
                        r.reason = reason.clone();
                    }
                }
            }
            Event::ReservationsFinalized { ids, at, .. } => {
                for r in self.reservations.iter_mut().filter(|r| ids.contains(&r.id)) {
                    r.status = ReservationStatus::Finalized;
                    r.updated_at = *at;
                }
            }
            Event::ReservationHidden { id, .. } => {
                if let Some(r) = self.get_mut(id) {
                    r.hidden = true;
                }
            }
        }
    }

    /// Minimal event sequence that rebuilds this ledger from nothing.
    pub fn compacted_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.reservations.len());
        for r in &self.reservations {
            events.push(Event::ReservationCreated {
                id: r.id,
                user_id: r.user_id,
                amenity_id: r.amenity_id,
                span: r.span,
                status: r.status,
                created_at: r.created_at,
            });
            if r.reason.is_some() || r.updated_at != r.created_at {
                events.push(Event::StatusChanged {
                    id: r.id,
                    amenity_id: r.amenity_id,
                    status: r.status,
                    reason: r.reason.clone(),
                    at: r.updated_at,
                });
            }
            if r.hidden {
                events.push(Event::ReservationHidden {
                    id: r.id,
                    amenity_id: r.amenity_id,
                });
            }
        }
        events
    }
}

/// A confirmed window held by a user, with its building-local start day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedWindow {
    pub reservation_id: Ulid,
    pub amenity_id: Ulid,
    pub span: Span,
    pub day: NaiveDate,
}

/// Per-user index of confirmed windows across every amenity.
#[derive(Debug, Clone, Default)]
pub struct UserLedger {
    pub confirmed: Vec<BookedWindow>,
}

impl UserLedger {
    pub fn add(&mut self, window: BookedWindow) {
        self.confirmed.retain(|w| w.reservation_id != window.reservation_id);
        self.confirmed.push(window);
    }

    pub fn remove(&mut self, reservation_id: &Ulid) {
        self.confirmed.retain(|w| w.reservation_id != *reservation_id);
    }

    /// First confirmed window overlapping `span`, skipping `exclude`.
    pub fn overlapping(&self, span: &Span, exclude: Option<Ulid>) -> Option<&BookedWindow> {
        self.confirmed
            .iter()
            .filter(|w| Some(w.reservation_id) != exclude)
            .find(|w| w.span.overlaps(span))
    }

    pub fn same_amenity_same_day(
        &self,
        amenity_id: Ulid,
        day: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Option<&BookedWindow> {
        self.confirmed
            .iter()
            .filter(|w| Some(w.reservation_id) != exclude)
            .find(|w| w.amenity_id == amenity_id && w.day == day)
    }
}

// ── Query result types ───────────────────────────────────────────

/// Point-in-time capacity count for a window. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub amenity_id: Ulid,
    pub span: Span,
    pub confirmed: u32,
    pub capacity: u32,
}

impl Occupancy {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.confirmed)
    }
}

/// `"HH:MM"` (seconds optional) for operating hours in catalog files.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
