use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::civil::BuildingZone;
use crate::directory::{Directory, UserProfile};
use crate::limits::OUTBOX_CAPACITY;
use crate::model::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ReservationConfirmed,
    ReservationPending,
    ReservationApproved,
    ReservationRejected,
    ReservationAutoRejected,
    ReservationCancelled,
    NewPendingReservation,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ReservationConfirmed => "reservation_confirmed",
            NotificationKind::ReservationPending => "reservation_pending",
            NotificationKind::ReservationApproved => "reservation_approved",
            NotificationKind::ReservationRejected => "reservation_rejected",
            NotificationKind::ReservationAutoRejected => "reservation_auto_rejected",
            NotificationKind::ReservationCancelled => "reservation_cancelled",
            NotificationKind::NewPendingReservation => "new_pending_reservation",
        }
    }
}

/// One side effect queued after a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    User {
        user_id: Ulid,
        reservation_id: Ulid,
        kind: NotificationKind,
        title: String,
        message: String,
    },
    Admins {
        kind: NotificationKind,
        reservation_id: Ulid,
    },
    Confirmation {
        user_id: Ulid,
        amenity_name: String,
        span: Span,
    },
    Cancellation {
        user_id: Ulid,
        amenity_name: String,
        span: Span,
        reason: Option<String>,
    },
}

impl Outbound {
    fn label(&self) -> &'static str {
        match self {
            Outbound::User { .. } => "notify_user",
            Outbound::Admins { .. } => "notify_admins",
            Outbound::Confirmation { .. } => "email_confirmation",
            Outbound::Cancellation { .. } => "email_cancellation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// In-app notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(
        &self,
        user_id: Ulid,
        reservation_id: Ulid,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) -> Result<(), DispatchError>;

    async fn notify_admins(&self, kind: NotificationKind, reservation_id: Ulid) -> Result<(), DispatchError>;
}

/// Email dispatch. Times arrive already in building-local time.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_confirmation(
        &self,
        email: &str,
        name: &str,
        amenity_name: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<(), DispatchError>;

    async fn send_cancellation(
        &self,
        email: &str,
        name: &str,
        amenity_name: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        reason: Option<&str>,
    ) -> Result<(), DispatchError>;
}

/// Producer side of the side-effect queue. `submit` never waits: if the queue is
/// full or the dispatcher is gone the message is logged and dropped.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn submit(&self, msg: Outbound) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!("outbox full, dropping {}", msg.label());
                metrics::counter!(crate::observability::OUTBOX_DROPPED_TOTAL, "reason" => "full")
                    .increment(1);
            }
            Err(TrySendError::Closed(msg)) => {
                debug!("outbox closed, dropping {}", msg.label());
                metrics::counter!(crate::observability::OUTBOX_DROPPED_TOTAL, "reason" => "closed")
                    .increment(1);
            }
        }
    }
}

/// Consumer side: drains the outbox and calls the collaborators.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn Directory>,
    zone: BuildingZone,
}

impl Dispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn Directory>,
        zone: BuildingZone,
    ) -> Self {
        Self {
            notifier,
            mailer,
            directory,
            zone,
        }
    }

    /// Runs until every `Outbox` clone is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Outbound>) {
        while let Some(msg) = rx.recv().await {
            self.deliver(msg).await;
        }
        debug!("outbox drained, dispatcher stopping");
    }

    /// Deliver one message. Failures are logged and counted, never returned.
    pub async fn deliver(&self, msg: Outbound) {
        let label = msg.label();
        if let Err(e) = self.try_deliver(msg).await {
            warn!("{label}: {e}");
            metrics::counter!(crate::observability::DISPATCH_FAILURES_TOTAL, "kind" => label)
                .increment(1);
        }
    }

    async fn try_deliver(&self, msg: Outbound) -> Result<(), DispatchError> {
        match msg {
            Outbound::User {
                user_id,
                reservation_id,
                kind,
                title,
                message,
            } => {
                self.notifier
                    .notify_user(user_id, reservation_id, kind, &title, &message)
                    .await
            }
            Outbound::Admins {
                kind,
                reservation_id,
            } => self.notifier.notify_admins(kind, reservation_id).await,
            Outbound::Confirmation {
                user_id,
                amenity_name,
                span,
            } => {
                let to = self.recipient(user_id).await?;
                self.mailer
                    .send_confirmation(
                        &to.email,
                        &to.name,
                        &amenity_name,
                        self.zone.local(span.start),
                        self.zone.local(span.end),
                    )
                    .await
            }
            Outbound::Cancellation {
                user_id,
                amenity_name,
                span,
                reason,
            } => {
                let to = self.recipient(user_id).await?;
                self.mailer
                    .send_cancellation(
                        &to.email,
                        &to.name,
                        &amenity_name,
                        self.zone.local(span.start),
                        self.zone.local(span.end),
                        reason.as_deref(),
                    )
                    .await
            }
        }
    }

    async fn recipient(&self, user_id: Ulid) -> Result<UserProfile, DispatchError> {
        self.directory
            .profile(user_id)
            .await
            .ok_or_else(|| DispatchError(format!("no directory entry for user {user_id}")))
    }
}

/// Notifier that only writes to the log. Used when no delivery backend is wired.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_user(
        &self,
        user_id: Ulid,
        reservation_id: Ulid,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) -> Result<(), DispatchError> {
        info!(%user_id, %reservation_id, kind = kind.as_str(), "{title}: {message}");
        Ok(())
    }

    async fn notify_admins(&self, kind: NotificationKind, reservation_id: Ulid) -> Result<(), DispatchError> {
        info!(%reservation_id, kind = kind.as_str(), "admin notification");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send_confirmation(
        &self,
        email: &str,
        _name: &str,
        amenity_name: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<(), DispatchError> {
        info!(to = email, "confirmation: {amenity_name} {start} - {end}");
        Ok(())
    }

    async fn send_cancellation(
        &self,
        email: &str,
        _name: &str,
        amenity_name: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        reason: Option<&str>,
    ) -> Result<(), DispatchError> {
        info!(
            to = email,
            "cancellation: {amenity_name} {start} - {end} ({})",
            reason.unwrap_or("no reason given")
        );
        Ok(())
    }
}
