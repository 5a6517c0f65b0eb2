use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Move every confirmed reservation that ended before `now` to `finalized`.
    /// One log event per amenity; no notifications. Returns how many changed.
    pub async fn finalize_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let mut total = 0;
        for amenity_id in self.ledger_ids() {
            total += self.finalize_amenity(amenity_id, now).await?;
        }
        Ok(total)
    }

    async fn finalize_amenity(&self, amenity_id: Ulid, now: Ms) -> Result<usize, EngineError> {
        let Some(shared) = self.ledger(&amenity_id) else {
            return Ok(0);
        };

        // Owners must be locked before the amenity, so find them under a read lock first.
        let owners: Vec<Ulid> = {
            let ledger = shared.read().await;
            expired(&ledger, now).map(|r| r.user_id).collect()
        };
        if owners.is_empty() {
            return Ok(0);
        }

        let mut users = self.lock_users(owners).await;
        let mut ledger = shared.write().await;
        // Anything cancelled in between is skipped; anything newly expired whose
        // owner we did not lock waits for the next pass.
        let due: Vec<(Ulid, Ulid)> = expired(&ledger, now)
            .filter(|r| users.contains_key(&r.user_id))
            .map(|r| (r.id, r.user_id))
            .collect();
        if due.is_empty() {
            debug!(%amenity_id, "nothing left to finalize");
            return Ok(0);
        }

        let event = Event::ReservationsFinalized {
            amenity_id,
            ids: due.iter().map(|(id, _)| *id).collect(),
            at: now,
        };
        self.commit("finalize", &mut ledger, event).await?;
        for (id, user_id) in &due {
            if let Some(user) = users.get_mut(user_id) {
                user.remove(id);
            }
        }
        info!(%amenity_id, count = due.len(), "finalized expired reservations");
        Ok(due.len())
    }
}

fn expired(ledger: &AmenityLedger, now: Ms) -> impl Iterator<Item = &Reservation> {
    ledger
        .reservations
        .iter()
        .filter(move |r| r.status == ReservationStatus::Confirmed && r.span.end < now)
}
