//! Approval race resolution.
//!
//! A pending request only counts against capacity once it is confirmed, so by
//! the time an admin approves it the window may already be full. Approval
//! re-checks under the owner's and the amenity's locks and either confirms or
//! cancels on the spot. The admin never gets a "try again" outcome.

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotificationKind, Outbound};

use super::capacity::{check_admission, now_ms};
use super::lifecycle::{require_admin, user_notice, Action};
use super::{Engine, EngineError};

#[derive(Debug)]
pub enum ApprovalOutcome {
    Approved(Reservation),
    /// The window filled up (or the owner booked something clashing) while the
    /// request waited. The reservation is now `cancelled`.
    AutoRejected {
        reservation: Reservation,
        cause: EngineError,
    },
}

impl ApprovalOutcome {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ApprovalOutcome::Approved(r) => r,
            ApprovalOutcome::AutoRejected { reservation, .. } => reservation,
        }
    }

    pub fn into_reservation(self) -> Reservation {
        match self {
            ApprovalOutcome::Approved(r) => r,
            ApprovalOutcome::AutoRejected { reservation, .. } => reservation,
        }
    }

    pub fn auto_rejected(&self) -> bool {
        matches!(self, ApprovalOutcome::AutoRejected { .. })
    }
}

impl Engine {
    pub async fn approve(&self, principal: &Principal, id: Ulid) -> Result<ApprovalOutcome, EngineError> {
        require_admin(principal)?;
        let at = self.locate_or_404(id)?;
        let amenity = self.amenity(at.amenity_id).await?;

        let mut user = self.lock_user(at.user_id).await;
        let shared = self
            .ledger(&at.amenity_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut ledger = shared.write().await;

        let current = ledger.get(&id).ok_or(EngineError::ReservationNotFound(id))?;
        let span = current.span;
        Action::Approve.transition(current.status)?;

        let day = self.zone.local_day(span.start);
        let (action, cause) = match check_admission(&amenity, &ledger, &user, &span, day, Some(id)) {
            Ok(()) => (Action::Approve, None),
            Err(cause) => (Action::AutoReject, Some(cause)),
        };
        let next = action.transition(ReservationStatus::Pending)?;
        let reason = cause.as_ref().map(ToString::to_string);

        let event = Event::StatusChanged {
            id,
            amenity_id: amenity.id,
            status: next,
            reason,
            at: now_ms(),
        };
        self.commit(action.as_str(), &mut ledger, event).await?;
        let reservation = ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        if next == ReservationStatus::Confirmed {
            user.add(self.booked_window(&reservation));
        }
        drop(ledger);
        drop(user);

        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
        let slot = self.describe_slot(&amenity.name, &reservation.span);
        match cause {
            None => {
                info!(%id, amenity = %amenity.name, "reservation approved");
                self.outbox.submit(user_notice(
                    &reservation,
                    NotificationKind::ReservationApproved,
                    "Reservation approved",
                    format!("Your request for {slot} was approved."),
                ));
                self.outbox.submit(Outbound::Confirmation {
                    user_id: reservation.user_id,
                    amenity_name: amenity.name.clone(),
                    span: reservation.span,
                });
                Ok(ApprovalOutcome::Approved(reservation))
            }
            Some(cause) => {
                warn!(%id, amenity = %amenity.name, "approval auto-rejected: {cause}");
                metrics::counter!(crate::observability::AUTO_REJECTIONS_TOTAL,
                    "reason" => cause.label())
                .increment(1);
                let message = match &cause {
                    EngineError::CapacityExceeded(_) => format!(
                        "Your request for {slot} could not be approved: {} is fully booked for that time.",
                        amenity.name
                    ),
                    other => format!("Your request for {slot} could not be approved: {other}."),
                };
                self.outbox.submit(user_notice(
                    &reservation,
                    NotificationKind::ReservationAutoRejected,
                    "Reservation rejected",
                    message,
                ));
                Ok(ApprovalOutcome::AutoRejected { reservation, cause })
            }
        }
    }
}
