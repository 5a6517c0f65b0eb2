use std::collections::HashMap;

use ulid::Ulid;

use crate::civil::parse_instant;
use crate::limits::*;
use crate::model::*;

use super::capacity::confirmed_overlap_count;
use super::lifecycle::require_admin;
use super::{Engine, EngineError, SharedLedger};

/// Bounds of a listing window. Unlike booking windows these need not respect hours.
pub fn parse_query_window(start: &str, end: &str) -> Result<Span, EngineError> {
    let start_ms = parse_instant(start).ok_or_else(|| EngineError::InvalidTimeFormat(start.to_string()))?;
    let end_ms = parse_instant(end).ok_or_else(|| EngineError::InvalidTimeFormat(end.to_string()))?;
    if start_ms >= end_ms {
        return Err(EngineError::InvalidInterval);
    }
    if end_ms - start_ms > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start_ms, end_ms))
}

impl Engine {
    /// Owner or admin only.
    pub async fn get_reservation(&self, principal: &Principal, id: Ulid) -> Result<Reservation, EngineError> {
        let at = self.locate_or_404(id)?;
        if at.user_id != principal.user_id && !principal.is_admin() {
            return Err(EngineError::Forbidden("not your reservation"));
        }
        let shared = self
            .ledger(&at.amenity_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let ledger = shared.read().await;
        ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// The caller's reservations, hidden ones excluded, earliest first.
    pub async fn list_own(&self, principal: &Principal) -> Vec<Reservation> {
        let mut by_amenity: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for entry in self.index.iter() {
            if entry.value().user_id == principal.user_id {
                by_amenity
                    .entry(entry.value().amenity_id)
                    .or_default()
                    .push(*entry.key());
            }
        }

        let ledgers: Vec<(SharedLedger, Vec<Ulid>)> = by_amenity
            .into_iter()
            .filter_map(|(amenity_id, ids)| self.ledger(&amenity_id).map(|l| (l, ids)))
            .collect();

        let mut out = Vec::new();
        for (shared, ids) in ledgers {
            let ledger = shared.read().await;
            out.extend(
                ids.iter()
                    .filter_map(|id| ledger.get(id))
                    .filter(|r| !r.hidden)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Non-cancelled reservations on an amenity overlapping `[start, end)`.
    pub async fn list_amenity(
        &self,
        amenity_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<Vec<Reservation>, EngineError> {
        let window = parse_query_window(start, end)?;
        self.amenity(amenity_id).await?;
        let Some(shared) = self.ledger(&amenity_id) else {
            return Ok(Vec::new());
        };
        let ledger = shared.read().await;
        Ok(ledger
            .overlapping(&window)
            .filter(|r| r.status != ReservationStatus::Cancelled)
            .cloned()
            .collect())
    }

    /// Admin queue of requests awaiting a decision, oldest request first.
    pub async fn list_pending(&self, principal: &Principal) -> Result<Vec<Reservation>, EngineError> {
        require_admin(principal)?;
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for shared in ledgers {
            let ledger = shared.read().await;
            out.extend(
                ledger
                    .reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Pending)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    /// Capacity Count for a window, alongside the amenity's capacity.
    pub async fn occupancy(&self, amenity_id: Ulid, start: &str, end: &str) -> Result<Occupancy, EngineError> {
        let span = parse_query_window(start, end)?;
        let amenity = self.amenity(amenity_id).await?;
        let confirmed = match self.ledger(&amenity_id) {
            Some(shared) => confirmed_overlap_count(&*shared.read().await, &span, None),
            None => 0,
        };
        Ok(Occupancy {
            amenity_id,
            span,
            confirmed,
            capacity: amenity.capacity,
        })
    }
}
