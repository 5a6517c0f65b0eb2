use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NotificationKind, Outbound};

use super::capacity::{check_admission, now_ms};
use super::window::validate_window;
use super::{Engine, EngineError, ReservationRef};

/// Every status change a caller (or the sweep) can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    AutoReject,
    SelfCancel,
    AdminCancel,
    Finalize,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::AutoReject => "auto-reject",
            Action::SelfCancel | Action::AdminCancel => "cancel",
            Action::Finalize => "finalize",
        }
    }

    /// The state table. Anything not listed fails with the current status.
    pub fn transition(self, current: ReservationStatus) -> Result<ReservationStatus, EngineError> {
        use ReservationStatus::*;
        match (self, current) {
            (Action::Approve, Pending) => Ok(Confirmed),
            (Action::Reject | Action::AutoReject, Pending) => Ok(Cancelled),
            (Action::SelfCancel | Action::AdminCancel, Confirmed) => Ok(Cancelled),
            (Action::Finalize, Confirmed) => Ok(Finalized),
            _ => Err(EngineError::InvalidStateTransition {
                action: self.as_str(),
                current,
            }),
        }
    }
}

pub(super) fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("administrator role required"))
    }
}

/// Trimmed, length-checked reason. Blank means no reason.
pub(super) fn clean_reason(reason: Option<&str>) -> Result<Option<String>, EngineError> {
    let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(Some(reason.to_string()))
}

pub(super) fn user_notice(
    r: &Reservation,
    kind: NotificationKind,
    title: &str,
    message: String,
) -> Outbound {
    Outbound::User {
        user_id: r.user_id,
        reservation_id: r.id,
        kind,
        title: title.to_string(),
        message,
    }
}

pub(super) fn with_reason(message: String, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{message} Reason: {reason}"),
        None => message,
    }
}

impl Engine {
    pub(super) fn describe_slot(&self, amenity_name: &str, span: &Span) -> String {
        let start = self.zone.local(span.start);
        let end = self.zone.local(span.end);
        format!(
            "{amenity_name} on {} from {} to {}",
            start.format("%Y-%m-%d"),
            start.format("%H:%M"),
            end.format("%H:%M")
        )
    }

    /// Display name for messages. A reservation outlives its amenity's catalog entry.
    pub(super) async fn amenity_name(&self, amenity_id: Ulid) -> String {
        match self.catalog.get_amenity(amenity_id).await {
            Some(a) => a.name,
            None => "the amenity".to_string(),
        }
    }

    /// Request a reservation for the calling user. Starts `confirmed`, or `pending`
    /// when the amenity requires approval.
    pub async fn create_reservation(
        &self,
        principal: &Principal,
        id: Ulid,
        amenity_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .create_checked(principal, id, amenity_id, start, end)
            .await;
        match &result {
            Ok(r) => {
                metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL,
                    "status" => r.status.as_str())
                .increment(1);
            }
            Err(e) => {
                debug!(%id, %amenity_id, user_id = %principal.user_id, "reservation rejected: {e}");
                metrics::counter!(crate::observability::RESERVATION_REJECTIONS_TOTAL,
                    "reason" => e.label())
                .increment(1);
            }
        }
        result
    }

    async fn create_checked(
        &self,
        principal: &Principal,
        id: Ulid,
        amenity_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<Reservation, EngineError> {
        let claim = self.claim_id(
            id,
            ReservationRef {
                amenity_id,
                user_id: principal.user_id,
            },
        )?;
        let amenity = self.amenity(amenity_id).await?;
        let span = validate_window(&amenity, &self.zone, start, end)?;
        let day = self.zone.local_day(span.start);

        let mut user = self.lock_user(principal.user_id).await;
        let shared = self.ledger_or_create(amenity.id);
        let mut ledger = shared.write().await;

        if ledger.len() >= MAX_RESERVATIONS_PER_AMENITY {
            return Err(EngineError::LimitExceeded("too many reservations on amenity"));
        }
        check_admission(&amenity, &ledger, &user, &span, day, None)?;

        let status = if amenity.requires_approval {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Confirmed
        };
        let event = Event::ReservationCreated {
            id,
            user_id: principal.user_id,
            amenity_id: amenity.id,
            span,
            status,
            created_at: now_ms(),
        };
        self.commit("create", &mut ledger, event).await?;
        claim.keep();

        let reservation = ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        if status == ReservationStatus::Confirmed {
            user.add(self.booked_window(&reservation));
        }
        drop(ledger);
        drop(user);

        info!(
            %id,
            amenity = %amenity.name,
            user_id = %principal.user_id,
            status = %status,
            "reservation created"
        );
        self.announce_created(&amenity, &reservation);
        Ok(reservation)
    }

    fn announce_created(&self, amenity: &Amenity, r: &Reservation) {
        let slot = self.describe_slot(&amenity.name, &r.span);
        if r.status == ReservationStatus::Confirmed {
            self.outbox.submit(user_notice(
                r,
                NotificationKind::ReservationConfirmed,
                "Reservation confirmed",
                format!("Your reservation for {slot} is confirmed."),
            ));
            self.outbox.submit(Outbound::Confirmation {
                user_id: r.user_id,
                amenity_name: amenity.name.clone(),
                span: r.span,
            });
        } else {
            self.outbox.submit(user_notice(
                r,
                NotificationKind::ReservationPending,
                "Reservation pending approval",
                format!("Your request for {slot} is waiting for administrator approval."),
            ));
            self.outbox.submit(Outbound::Admins {
                kind: NotificationKind::NewPendingReservation,
                reservation_id: r.id,
            });
        }
    }

    /// Owner cancels their own confirmed reservation.
    pub async fn cancel_own(
        &self,
        principal: &Principal,
        id: Ulid,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let reason = clean_reason(reason)?;
        let caller = principal.user_id;
        self.apply_action(id, reason, |r| {
            if r.user_id == caller {
                Ok(Action::SelfCancel)
            } else {
                Err(EngineError::Forbidden("only the owner may cancel this reservation"))
            }
        })
        .await
    }

    /// Admin turns down a pending request.
    pub async fn reject(
        &self,
        principal: &Principal,
        id: Ulid,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        require_admin(principal)?;
        let reason = clean_reason(reason)?;
        self.apply_action(id, reason, |_| Ok(Action::Reject)).await
    }

    /// Admin cancels any confirmed reservation.
    pub async fn admin_cancel(
        &self,
        principal: &Principal,
        id: Ulid,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        require_admin(principal)?;
        let reason = clean_reason(reason)?;
        self.apply_action(id, reason, |_| Ok(Action::AdminCancel)).await
    }

    /// "Cancel" as the caller means it: residents self-cancel; admins reject a
    /// pending request or cancel a confirmed one.
    pub async fn cancel_as(
        &self,
        principal: &Principal,
        id: Ulid,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        if !principal.is_admin() {
            return self.cancel_own(principal, id, reason).await;
        }
        let reason = clean_reason(reason)?;
        self.apply_action(id, reason, |r| {
            Ok(if r.status == ReservationStatus::Pending {
                Action::Reject
            } else {
                Action::AdminCancel
            })
        })
        .await
    }

    /// Run one non-approval transition under the owner's and the amenity's locks.
    /// `choose` sees the current row and picks the action (or refuses).
    async fn apply_action(
        &self,
        id: Ulid,
        reason: Option<String>,
        choose: impl FnOnce(&Reservation) -> Result<Action, EngineError>,
    ) -> Result<Reservation, EngineError> {
        let at = self.locate_or_404(id)?;
        let amenity_name = self.amenity_name(at.amenity_id).await;

        let mut user = self.lock_user(at.user_id).await;
        let shared = self
            .ledger(&at.amenity_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut ledger = shared.write().await;

        let current = ledger.get(&id).ok_or(EngineError::ReservationNotFound(id))?;
        let action = choose(current)?;
        let previous = current.status;
        let next = action.transition(previous)?;

        let event = Event::StatusChanged {
            id,
            amenity_id: at.amenity_id,
            status: next,
            reason: reason.clone(),
            at: now_ms(),
        };
        self.commit(action.as_str(), &mut ledger, event).await?;
        let reservation = ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        if previous == ReservationStatus::Confirmed {
            user.remove(&id);
        }
        drop(ledger);
        drop(user);

        info!(%id, action = action.as_str(), from = %previous, to = %next, "reservation transition");
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => next.as_str())
            .increment(1);
        self.announce_transition(action, &amenity_name, &reservation);
        Ok(reservation)
    }

    fn announce_transition(&self, action: Action, amenity_name: &str, r: &Reservation) {
        let slot = self.describe_slot(amenity_name, &r.span);
        let reason = r.reason.as_deref();
        let (kind, title, message) = match action {
            Action::Reject => (
                NotificationKind::ReservationRejected,
                "Reservation rejected",
                with_reason(format!("Your request for {slot} was rejected."), reason),
            ),
            Action::SelfCancel => (
                NotificationKind::ReservationCancelled,
                "Reservation cancelled",
                format!("You cancelled your reservation for {slot}."),
            ),
            Action::AdminCancel => (
                NotificationKind::ReservationCancelled,
                "Reservation cancelled",
                with_reason(
                    format!("Your reservation for {slot} was cancelled by the administration."),
                    reason,
                ),
            ),
            // Approval and finalization announce themselves elsewhere.
            Action::Approve | Action::AutoReject | Action::Finalize => return,
        };
        self.outbox.submit(user_notice(r, kind, title, message));
        if matches!(action, Action::SelfCancel | Action::AdminCancel) {
            self.outbox.submit(Outbound::Cancellation {
                user_id: r.user_id,
                amenity_name: amenity_name.to_string(),
                span: r.span,
                reason: r.reason.clone(),
            });
        }
    }

    /// Owner hides a finished reservation from their own listings. Idempotent.
    pub async fn hide_reservation(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let at = self.locate_or_404(id)?;
        let shared = self
            .ledger(&at.amenity_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut ledger = shared.write().await;

        let current = ledger.get(&id).ok_or(EngineError::ReservationNotFound(id))?;
        if current.user_id != principal.user_id {
            return Err(EngineError::Forbidden("only the owner may hide this reservation"));
        }
        if !current.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                action: "hide",
                current: current.status,
            });
        }
        if current.hidden {
            return Ok(current.clone());
        }

        let event = Event::ReservationHidden {
            id,
            amenity_id: at.amenity_id,
        };
        self.commit("hide", &mut ledger, event).await?;
        ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }
}
