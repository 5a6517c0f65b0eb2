mod approval;
mod capacity;
mod error;
mod expiry;
mod lifecycle;
mod queries;
#[cfg(test)]
mod tests;
mod window;

pub use approval::ApprovalOutcome;
pub use capacity::{
    confirmed_overlap_count, has_capacity, user_has_overlap, user_has_same_amenity_same_day,
};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::Action;
pub use window::validate_window;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::catalog::AmenityCatalog;
use crate::civil::BuildingZone;
use crate::model::*;
use crate::notify::Outbox;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<AmenityLedger>>;
pub type SharedUserLedger = Arc<Mutex<UserLedger>>;

/// Where a reservation lives: its amenity ledger and its owner's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRef {
    pub amenity_id: Ulid,
    pub user_id: Ulid,
}

// ── Group-commit WAL writer ──────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the log file plus a copy of the state folded from every durable event.
/// Compaction rewrites from that copy, so it never races with in-flight commits.
struct WalWriter {
    wal: Wal,
    snapshot: HashMap<Ulid, AmenityLedger>,
}

impl WalWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<WalCommand>) {
        while let Some(cmd) = rx.recv().await {
            let mut batch = match cmd {
                WalCommand::Append { event, response } => vec![(event, response)],
                other => {
                    self.handle_other(other);
                    continue;
                }
            };
            let mut deferred = None;
            while let Ok(next) = rx.try_recv() {
                match next {
                    WalCommand::Append { event, response } => batch.push((event, response)),
                    other => {
                        deferred = Some(other);
                        break;
                    }
                }
            }
            self.commit_batch(batch);
            if let Some(cmd) = deferred {
                self.handle_other(cmd);
            }
        }
    }

    fn commit_batch(&mut self, batch: Vec<PendingAppend>) {
        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = self.write_batch(&batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        for (event, response) in batch {
            let reply = match &result {
                Ok(()) => {
                    self.fold(&event);
                    Ok(())
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = response.send(reply);
        }
    }

    /// All or nothing: a batch that fails to stage or sync is cut back out of the file.
    fn write_batch(&mut self, batch: &[PendingAppend]) -> io::Result<()> {
        if self.wal.is_failed() {
            self.rewrite_from_snapshot()?;
            warn!("reservation log rebuilt after a failed append");
        }
        let result = batch
            .iter()
            .try_for_each(|(event, _)| self.wal.stage(event))
            .and_then(|()| self.wal.sync());
        if result.is_err()
            && let Err(e) = self.wal.discard_unsynced()
        {
            error!(
                path = %self.wal.path().display(),
                failed = self.wal.is_failed(),
                "could not cut failed batch from reservation log: {e}"
            );
        }
        result
    }

    fn fold(&mut self, event: &Event) {
        let amenity_id = event.amenity_id();
        self.snapshot
            .entry(amenity_id)
            .or_insert_with(|| AmenityLedger::new(amenity_id))
            .apply(event);
    }

    /// Replace the log with the minimal events for every durable reservation.
    fn rewrite_from_snapshot(&mut self) -> io::Result<usize> {
        let events: Vec<Event> = self
            .snapshot
            .values()
            .flat_map(AmenityLedger::compacted_events)
            .collect();
        self.wal.rewrite(&events).map(|()| events.len())
    }

    fn handle_other(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { response } => {
                let _ = response.send(self.rewrite_from_snapshot());
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append { event, response } => self.commit_batch(vec![(event, response)]),
        }
    }
}

#[derive(Clone)]
struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    fn spawn(wal: Wal, snapshot: HashMap<Ulid, AmenityLedger>) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(WalWriter { wal, snapshot }.run(rx));
        Self { tx }
    }

    /// A handle whose writer is gone: every call fails as the store being down.
    #[cfg(test)]
    fn closed() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))
    }

    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let event = event.clone();
        self.request(|response| WalCommand::Append { event, response })
            .await?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    async fn compact(&self) -> Result<usize, EngineError> {
        self.request(|response| WalCommand::Compact { response })
            .await?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        self.request(|response| WalCommand::AppendsSinceCompact { response })
            .await
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    ledgers: DashMap<Ulid, SharedLedger>,
    users: DashMap<Ulid, SharedUserLedger>,
    index: DashMap<Ulid, ReservationRef>,
    wal: WalHandle,
    catalog: Arc<dyn AmenityCatalog>,
    outbox: Outbox,
    zone: BuildingZone,
}

impl Engine {
    /// Replay the log at `wal_path` and start the writer task. Must run inside a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn AmenityCatalog>,
        outbox: Outbox,
        zone: BuildingZone,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded torn tail of reservation log");
        }

        let mut ledgers: HashMap<Ulid, AmenityLedger> = HashMap::new();
        for event in &replay.events {
            let amenity_id = event.amenity_id();
            match event {
                Event::ReservationCreated { .. } => ledgers
                    .entry(amenity_id)
                    .or_insert_with(|| AmenityLedger::new(amenity_id))
                    .apply(event),
                _ => {
                    if let Some(ledger) = ledgers.get_mut(&amenity_id) {
                        ledger.apply(event);
                    }
                }
            }
        }

        let index = DashMap::new();
        let mut users: HashMap<Ulid, UserLedger> = HashMap::new();
        for ledger in ledgers.values() {
            for r in &ledger.reservations {
                index.insert(
                    r.id,
                    ReservationRef {
                        amenity_id: r.amenity_id,
                        user_id: r.user_id,
                    },
                );
                if r.status == ReservationStatus::Confirmed {
                    users.entry(r.user_id).or_default().add(booked_window(&zone, r));
                }
            }
        }
        info!(
            events = replay.events.len(),
            amenities = ledgers.len(),
            reservations = index.len(),
            "reservation log replayed"
        );

        let mut wal = Wal::open(&wal_path)?;
        if replay.discarded_tail {
            // Appending after torn bytes would hide every later frame from the next replay.
            wal.rewrite(&replay.events)?;
        }
        let wal = WalHandle::spawn(wal, ledgers.clone());
        Ok(Self {
            ledgers: ledgers
                .into_iter()
                .map(|(id, l)| (id, Arc::new(RwLock::new(l))))
                .collect(),
            users: users
                .into_iter()
                .map(|(id, u)| (id, Arc::new(Mutex::new(u))))
                .collect(),
            index,
            wal,
            catalog,
            outbox,
            zone,
        })
    }

    pub fn zone(&self) -> &BuildingZone {
        &self.zone
    }

    pub fn reservation_count(&self) -> usize {
        self.index.len()
    }

    pub fn locate(&self, reservation_id: &Ulid) -> Option<ReservationRef> {
        self.index.get(reservation_id).map(|e| *e.value())
    }

    pub(super) fn locate_or_404(&self, reservation_id: Ulid) -> Result<ReservationRef, EngineError> {
        self.locate(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))
    }

    pub(super) async fn amenity(&self, amenity_id: Ulid) -> Result<Amenity, EngineError> {
        self.catalog
            .get_amenity(amenity_id)
            .await
            .ok_or(EngineError::AmenityNotFound(amenity_id))
    }

    pub(super) fn ledger(&self, amenity_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(amenity_id).map(|e| e.value().clone())
    }

    pub(super) fn ledger_or_create(&self, amenity_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(amenity_id)
            .or_insert_with(|| Arc::new(RwLock::new(AmenityLedger::new(amenity_id))))
            .clone()
    }

    pub(super) fn ledger_ids(&self) -> Vec<Ulid> {
        self.ledgers.iter().map(|e| *e.key()).collect()
    }

    pub(super) async fn lock_user(&self, user_id: Ulid) -> OwnedMutexGuard<UserLedger> {
        let shared = self
            .users
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(UserLedger::default())))
            .clone();
        shared.lock_owned().await
    }

    /// Lock several users in id order. Every multi-user path goes through here.
    pub(super) async fn lock_users(
        &self,
        mut user_ids: Vec<Ulid>,
    ) -> HashMap<Ulid, OwnedMutexGuard<UserLedger>> {
        user_ids.sort();
        user_ids.dedup();
        let mut guards = HashMap::with_capacity(user_ids.len());
        for id in user_ids {
            guards.insert(id, self.lock_user(id).await);
        }
        guards
    }

    /// Reserve `id` in the index before anything is validated or logged, so two
    /// creates racing on one id cannot both commit. The claim is released on
    /// drop unless `IdClaim::keep` is called.
    pub(super) fn claim_id(&self, id: Ulid, at: ReservationRef) -> Result<IdClaim<'_>, EngineError> {
        match self.index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(at);
                Ok(IdClaim {
                    index: &self.index,
                    id,
                    kept: false,
                })
            }
        }
    }

    pub(super) fn booked_window(&self, r: &Reservation) -> BookedWindow {
        booked_window(&self.zone, r)
    }

    /// Durably log `event`, then fold it into the locked ledger.
    /// Nothing changes in memory if the log append fails. New ids must already
    /// be claimed with `claim_id`.
    pub(super) async fn commit(
        &self,
        op: &'static str,
        ledger: &mut AmenityLedger,
        event: Event,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.wal.append(&event).await {
            error!(op, amenity_id = %ledger.amenity_id, "store append failed: {e}");
            return Err(e);
        }
        ledger.apply(&event);
        Ok(())
    }

    /// Rewrite the log down to the current state. Returns the number of events kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        self.wal.compact().await
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal.appends_since_compact().await
    }
}

/// A reservation id held in the index while its create is in flight.
pub(super) struct IdClaim<'a> {
    index: &'a DashMap<Ulid, ReservationRef>,
    id: Ulid,
    kept: bool,
}

impl IdClaim<'_> {
    /// The create committed; the index entry stays.
    pub(super) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.index.remove(&self.id);
        }
    }
}

fn booked_window(zone: &BuildingZone, r: &Reservation) -> BookedWindow {
    BookedWindow {
        reservation_id: r.id,
        amenity_id: r.amenity_id,
        span: r.span,
        day: zone.local_day(r.span.start),
    }
}
