use super::*;
use super::capacity::now_ms;
use crate::catalog::StaticCatalog;
use crate::notify::{NotificationKind, Outbound};

use chrono::NaiveTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const M: Ms = MINUTE_MS;
const H: Ms = 60 * M;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("concierge_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn amenity(name: &str, capacity: u32, requires_approval: bool) -> Amenity {
    Amenity {
        id: Ulid::new(),
        name: name.into(),
        capacity,
        max_duration_minutes: 60,
        hours: Some(OperatingHours {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        }),
        is_active: true,
        requires_approval,
    }
}

fn open_all_day(name: &str, capacity: u32, requires_approval: bool) -> Amenity {
    Amenity {
        hours: None,
        max_duration_minutes: 120,
        ..amenity(name, capacity, requires_approval)
    }
}

fn start_engine(path: PathBuf, amenities: &[Amenity]) -> (Engine, mpsc::Receiver<Outbound>) {
    let catalog = StaticCatalog::new(amenities.to_vec()).unwrap();
    let (outbox, rx) = Outbox::channel();
    let engine = Engine::new(path, Arc::new(catalog), outbox, BuildingZone::default()).unwrap();
    (engine, rx)
}

/// Building-local wall clock on a fixed future day.
fn at(hm: &str) -> String {
    format!("2030-03-04T{hm}:00-03:00")
}

fn resident() -> Principal {
    Principal::resident(Ulid::new())
}

fn admin() -> Principal {
    Principal::admin(Ulid::new())
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn user_kinds(msgs: &[Outbound]) -> Vec<NotificationKind> {
    msgs.iter()
        .filter_map(|m| match m {
            Outbound::User { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

async fn book(engine: &Engine, who: &Principal, amenity: &Amenity, start: &str, end: &str) -> Result<Reservation, EngineError> {
    engine
        .create_reservation(who, Ulid::new(), amenity.id, start, end)
        .await
}

// ── End-to-end scenarios ─────────────────────────────────

#[tokio::test]
async fn third_overlapping_booking_exceeds_capacity() {
    let pool = amenity("Pool", 2, false);
    let (engine, _rx) = start_engine(test_wal_path("capacity_two.wal"), std::slice::from_ref(&pool));

    let first = book(&engine, &resident(), &pool, &at("10:00"), &at("10:30")).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Confirmed);
    let second = book(&engine, &resident(), &pool, &at("10:15"), &at("10:45")).await.unwrap();
    assert_eq!(second.status, ReservationStatus::Confirmed);

    let err = book(&engine, &resident(), &pool, &at("10:20"), &at("10:40")).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(2)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(engine.reservation_count(), 2);
}

#[tokio::test]
async fn window_past_close_is_rejected() {
    let mut grill = amenity("Grill", 1, false);
    grill.max_duration_minutes = 120;
    grill.hours = Some(OperatingHours {
        open: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        close: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
    });
    let (engine, _rx) = start_engine(test_wal_path("past_close.wal"), std::slice::from_ref(&grill));

    let err = book(&engine, &resident(), &grill, &at("19:30"), &at("20:30")).await.unwrap_err();
    assert!(matches!(err, EngineError::OutsideOperatingHours { .. }));
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn pending_requests_in_separate_windows_both_approve() {
    let room = amenity("Party room", 1, true);
    let (engine, _rx) = start_engine(test_wal_path("separate_windows.wal"), std::slice::from_ref(&room));
    let desk = admin();

    let a = book(&engine, &resident(), &room, &at("09:00"), &at("10:00")).await.unwrap();
    let b = book(&engine, &resident(), &room, &at("11:00"), &at("12:00")).await.unwrap();
    assert_eq!(a.status, ReservationStatus::Pending);
    assert_eq!(b.status, ReservationStatus::Pending);

    let first = engine.approve(&desk, a.id).await.unwrap();
    assert!(!first.auto_rejected());
    assert_eq!(first.reservation().status, ReservationStatus::Confirmed);
    let second = engine.approve(&desk, b.id).await.unwrap();
    assert!(!second.auto_rejected());
    assert_eq!(second.reservation().status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn approving_into_a_full_window_auto_rejects() {
    let room = amenity("Party room", 1, true);
    let (engine, mut rx) = start_engine(test_wal_path("auto_reject.wal"), std::slice::from_ref(&room));
    let desk = admin();

    let a = book(&engine, &resident(), &room, &at("09:00"), &at("10:00")).await.unwrap();
    let b = book(&engine, &resident(), &room, &at("09:30"), &at("10:30")).await.unwrap();
    assert!(!engine.approve(&desk, a.id).await.unwrap().auto_rejected());
    drain(&mut rx);

    let outcome = engine.approve(&desk, b.id).await.unwrap();
    assert!(outcome.auto_rejected());
    let ApprovalOutcome::AutoRejected { reservation, cause } = outcome else {
        unreachable!()
    };
    assert!(matches!(cause, EngineError::CapacityExceeded(1)));
    assert_eq!(reservation.status, ReservationStatus::Cancelled);
    assert!(reservation.reason.is_some());

    let msgs = drain(&mut rx);
    assert_eq!(user_kinds(&msgs), vec![NotificationKind::ReservationAutoRejected]);
    assert!(!msgs.iter().any(|m| matches!(m, Outbound::Confirmation { .. })));

    // Terminal: a second approval attempt is an illegal transition.
    let err = engine.approve(&desk, b.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition { current: ReservationStatus::Cancelled, .. }
    ));
}

#[tokio::test]
async fn sweep_finalizes_once() {
    let gym = open_all_day("Gym", 3, false);
    let (engine, mut rx) = start_engine(test_wal_path("sweep_once.wal"), std::slice::from_ref(&gym));
    let who = resident();

    let now = now_ms();
    let past = book(&engine, &who, &gym, &(now - 70 * M).to_string(), &(now - 10 * M).to_string())
        .await
        .unwrap();
    let future = book(&engine, &resident(), &gym, &(now + H).to_string(), &(now + 2 * H).to_string())
        .await
        .unwrap();
    drain(&mut rx);

    assert_eq!(engine.finalize_expired(now).await.unwrap(), 1);
    assert_eq!(engine.finalize_expired(now).await.unwrap(), 0);

    let past = engine.get_reservation(&who, past.id).await.unwrap();
    assert_eq!(past.status, ReservationStatus::Finalized);
    let future = engine.get_reservation(&admin(), future.id).await.unwrap();
    assert_eq!(future.status, ReservationStatus::Confirmed);
    assert!(drain(&mut rx).is_empty(), "finalizing sends nothing");
}

// ── Admission checks ─────────────────────────────────────

#[tokio::test]
async fn same_amenity_twice_a_day_is_refused() {
    let pool = amenity("Pool", 5, false);
    let (engine, _rx) = start_engine(test_wal_path("same_day.wal"), std::slice::from_ref(&pool));
    let who = resident();

    book(&engine, &who, &pool, &at("09:00"), &at("09:30")).await.unwrap();
    let err = book(&engine, &who, &pool, &at("18:00"), &at("18:30")).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDailyBooking(_)));
}

#[tokio::test]
async fn overlap_across_amenities_is_refused() {
    let pool = amenity("Pool", 5, false);
    let gym = amenity("Gym", 5, false);
    let (engine, _rx) = start_engine(test_wal_path("cross_overlap.wal"), &[pool.clone(), gym.clone()]);
    let who = resident();

    let held = book(&engine, &who, &pool, &at("09:00"), &at("10:00")).await.unwrap();
    let err = book(&engine, &who, &gym, &at("09:30"), &at("10:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::UserTimeConflict(id) if id == held.id));

    // Back to back is fine.
    book(&engine, &who, &gym, &at("10:00"), &at("10:30")).await.unwrap();
}

#[tokio::test]
async fn user_overlap_reported_before_capacity() {
    let pool = amenity("Pool", 1, false);
    let (engine, _rx) = start_engine(test_wal_path("order_overlap.wal"), std::slice::from_ref(&pool));
    let who = resident();

    book(&engine, &who, &pool, &at("09:00"), &at("10:00")).await.unwrap();
    let err = book(&engine, &who, &pool, &at("09:15"), &at("09:45")).await.unwrap_err();
    assert!(matches!(err, EngineError::UserTimeConflict(_)));
}

#[tokio::test]
async fn pending_requests_do_not_hold_the_user() {
    let room = amenity("Party room", 1, true);
    let pool = amenity("Pool", 1, false);
    let (engine, _rx) = start_engine(test_wal_path("pending_no_hold.wal"), &[room.clone(), pool.clone()]);
    let who = resident();

    book(&engine, &who, &room, &at("09:00"), &at("10:00")).await.unwrap();
    // Only confirmed reservations constrain the user.
    book(&engine, &who, &pool, &at("09:00"), &at("10:00")).await.unwrap();
}

#[tokio::test]
async fn approval_rechecks_owner_conflicts() {
    let room = amenity("Party room", 2, true);
    let gym = amenity("Gym", 2, false);
    let (engine, _rx) = start_engine(test_wal_path("approval_owner.wal"), &[room.clone(), gym.clone()]);
    let who = resident();

    let request = book(&engine, &who, &room, &at("09:00"), &at("10:00")).await.unwrap();
    book(&engine, &who, &gym, &at("09:30"), &at("10:30")).await.unwrap();

    let outcome = engine.approve(&admin(), request.id).await.unwrap();
    let ApprovalOutcome::AutoRejected { cause, .. } = outcome else {
        panic!("expected auto-rejection");
    };
    assert!(matches!(cause, EngineError::UserTimeConflict(_)));
}

#[tokio::test]
async fn inactive_amenity_wins_over_bad_times() {
    let mut pool = amenity("Pool", 1, false);
    pool.is_active = false;
    let (engine, _rx) = start_engine(test_wal_path("inactive.wal"), std::slice::from_ref(&pool));
    let err = book(&engine, &resident(), &pool, "soon", "later").await.unwrap_err();
    assert!(matches!(err, EngineError::AmenityInactive(_)));
}

#[tokio::test]
async fn unknown_ids_and_duplicates() {
    let pool = amenity("Pool", 2, false);
    let (engine, _rx) = start_engine(test_wal_path("unknown_ids.wal"), std::slice::from_ref(&pool));
    let who = resident();

    let err = engine
        .create_reservation(&who, Ulid::new(), Ulid::new(), &at("09:00"), &at("09:30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AmenityNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let id = Ulid::new();
    engine
        .create_reservation(&who, id, pool.id, &at("09:00"), &at("09:30"))
        .await
        .unwrap();
    let err = engine
        .create_reservation(&resident(), id, pool.id, &at("11:00"), &at("11:30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(x) if x == id));

    let err = engine.cancel_own(&who, Ulid::new(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::ReservationNotFound(_)));
}

// ── State machine and authorization ──────────────────────

#[tokio::test]
async fn only_the_owner_may_self_cancel() {
    let pool = amenity("Pool", 1, false);
    let (engine, _rx) = start_engine(test_wal_path("owner_cancel.wal"), std::slice::from_ref(&pool));
    let owner = resident();

    let r = book(&engine, &owner, &pool, &at("09:00"), &at("10:00")).await.unwrap();
    let err = engine.cancel_own(&resident(), r.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert_eq!(err.kind().http_status(), 403);

    let cancelled = engine.cancel_own(&owner, r.id, None).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn self_cancel_frees_capacity_and_the_day() {
    let pool = amenity("Pool", 1, false);
    let (engine, mut rx) = start_engine(test_wal_path("cancel_frees.wal"), std::slice::from_ref(&pool));
    let owner = resident();

    let r = book(&engine, &owner, &pool, &at("09:00"), &at("10:00")).await.unwrap();
    drain(&mut rx);
    engine.cancel_own(&owner, r.id, Some("plans changed")).await.unwrap();

    let msgs = drain(&mut rx);
    assert_eq!(user_kinds(&msgs), vec![NotificationKind::ReservationCancelled]);
    assert!(msgs.iter().any(|m| matches!(m, Outbound::Cancellation { reason: Some(r), .. } if r == "plans changed")));

    // The slot is open to others again and the owner's day is free.
    book(&engine, &resident(), &pool, &at("09:00"), &at("10:00")).await.unwrap();
    let later = book(&engine, &owner, &pool, &at("15:00"), &at("16:00")).await.unwrap();
    assert_eq!(later.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn residents_cannot_run_admin_actions() {
    let room = amenity("Party room", 1, true);
    let (engine, _rx) = start_engine(test_wal_path("admin_only.wal"), std::slice::from_ref(&room));
    let owner = resident();
    let r = book(&engine, &owner, &room, &at("09:00"), &at("10:00")).await.unwrap();

    assert!(matches!(engine.approve(&owner, r.id).await, Err(EngineError::Forbidden(_))));
    assert!(matches!(engine.reject(&owner, r.id, None).await, Err(EngineError::Forbidden(_))));
    assert!(matches!(engine.admin_cancel(&owner, r.id, None).await, Err(EngineError::Forbidden(_))));
    assert!(matches!(engine.list_pending(&owner).await, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn owner_cannot_withdraw_a_pending_request() {
    let room = amenity("Party room", 1, true);
    let (engine, _rx) = start_engine(test_wal_path("pending_withdraw.wal"), std::slice::from_ref(&room));
    let owner = resident();
    let r = book(&engine, &owner, &room, &at("09:00"), &at("10:00")).await.unwrap();

    let err = engine.cancel_own(&owner, r.id, None).await.unwrap_err();
    assert_eq!(err.to_string(), "cannot cancel reservation: current status is pending");
}

#[tokio::test]
async fn reject_keeps_reason_and_notifies() {
    let room = amenity("Party room", 1, true);
    let (engine, mut rx) = start_engine(test_wal_path("reject_reason.wal"), std::slice::from_ref(&room));
    let owner = resident();
    let r = book(&engine, &owner, &room, &at("09:00"), &at("10:00")).await.unwrap();

    let msgs = drain(&mut rx);
    assert_eq!(user_kinds(&msgs), vec![NotificationKind::ReservationPending]);
    assert!(msgs.iter().any(|m| matches!(m,
        Outbound::Admins { kind: NotificationKind::NewPendingReservation, reservation_id } if *reservation_id == r.id)));

    let rejected = engine.reject(&admin(), r.id, Some("room booked for maintenance")).await.unwrap();
    assert_eq!(rejected.status, ReservationStatus::Cancelled);
    assert_eq!(rejected.reason.as_deref(), Some("room booked for maintenance"));

    let msgs = drain(&mut rx);
    match msgs.as_slice() {
        [Outbound::User { kind, message, .. }] => {
            assert_eq!(*kind, NotificationKind::ReservationRejected);
            assert!(message.contains("room booked for maintenance"));
        }
        other => panic!("unexpected side effects: {other:?}"),
    }
}

#[tokio::test]
async fn admin_cancel_picks_the_right_transition() {
    let room = amenity("Party room", 2, true);
    let (engine, _rx) = start_engine(test_wal_path("cancel_as.wal"), std::slice::from_ref(&room));
    let desk = admin();

    let pending = book(&engine, &resident(), &room, &at("09:00"), &at("10:00")).await.unwrap();
    let confirmed = book(&engine, &resident(), &room, &at("11:00"), &at("12:00")).await.unwrap();
    engine.approve(&desk, confirmed.id).await.unwrap();

    let a = engine.cancel_as(&desk, pending.id, None).await.unwrap();
    let b = engine.cancel_as(&desk, confirmed.id, Some("flooding")).await.unwrap();
    assert_eq!(a.status, ReservationStatus::Cancelled);
    assert_eq!(b.status, ReservationStatus::Cancelled);
    assert_eq!(b.reason.as_deref(), Some("flooding"));

    let err = engine.admin_cancel(&desk, pending.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn terminal_reservations_refuse_every_action() {
    let gym = open_all_day("Gym", 2, false);
    let (engine, _rx) = start_engine(test_wal_path("terminal.wal"), std::slice::from_ref(&gym));
    let desk = admin();
    let owner = resident();

    let now = now_ms();
    let finished = book(&engine, &owner, &gym, &(now - 2 * H).to_string(), &(now - H).to_string())
        .await
        .unwrap();
    engine.finalize_expired(now).await.unwrap();
    let cancelled = book(&engine, &owner, &gym, &(now + H).to_string(), &(now + 2 * H).to_string())
        .await
        .unwrap();
    engine.cancel_own(&owner, cancelled.id, None).await.unwrap();

    for id in [finished.id, cancelled.id] {
        let attempts = [
            engine.approve(&desk, id).await.map(ApprovalOutcome::into_reservation),
            engine.reject(&desk, id, None).await,
            engine.admin_cancel(&desk, id, None).await,
            engine.cancel_own(&owner, id, None).await,
        ];
        for attempt in attempts {
            assert!(matches!(attempt, Err(EngineError::InvalidStateTransition { .. })));
        }
    }
}

#[tokio::test]
async fn hide_only_finished_reservations() {
    let pool = amenity("Pool", 2, false);
    let (engine, _rx) = start_engine(test_wal_path("hide.wal"), std::slice::from_ref(&pool));
    let owner = resident();

    let r = book(&engine, &owner, &pool, &at("09:00"), &at("10:00")).await.unwrap();
    let err = engine.hide_reservation(&owner, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { action: "hide", .. }));

    engine.cancel_own(&owner, r.id, None).await.unwrap();
    let err = engine.hide_reservation(&resident(), r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    assert!(engine.hide_reservation(&owner, r.id).await.unwrap().hidden);
    assert!(engine.hide_reservation(&owner, r.id).await.unwrap().hidden);
    assert!(engine.list_own(&owner).await.is_empty());
    // Still reachable directly.
    assert!(engine.get_reservation(&owner, r.id).await.unwrap().hidden);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn listings() {
    let pool = amenity("Pool", 3, false);
    let room = amenity("Party room", 1, true);
    let (engine, _rx) = start_engine(test_wal_path("listings.wal"), &[pool.clone(), room.clone()]);
    let owner = resident();
    let desk = admin();

    let late = book(&engine, &owner, &pool, &at("15:00"), &at("16:00")).await.unwrap();
    let early = book(&engine, &owner, &room, &at("09:00"), &at("10:00")).await.unwrap();
    let other = book(&engine, &resident(), &pool, &at("15:30"), &at("16:00")).await.unwrap();
    let gone = book(&engine, &resident(), &pool, &at("12:00"), &at("13:00")).await.unwrap();
    engine.admin_cancel(&desk, gone.id, None).await.unwrap();

    let own: Vec<Ulid> = engine.list_own(&owner).await.iter().map(|r| r.id).collect();
    assert_eq!(own, vec![early.id, late.id]);

    let on_pool: Vec<Ulid> = engine
        .list_amenity(pool.id, &at("00:00"), "2030-03-05T00:00:00-03:00")
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(on_pool, vec![late.id, other.id]);

    let pending = engine.list_pending(&desk).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, early.id);

    let occ = engine.occupancy(pool.id, &at("15:45"), &at("15:50")).await.unwrap();
    assert_eq!((occ.confirmed, occ.capacity, occ.remaining()), (2, 3, 1));

    let err = engine.get_reservation(&resident(), late.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert!(engine.get_reservation(&desk, late.id).await.is_ok());

    assert!(matches!(
        engine.list_amenity(Ulid::new(), &at("00:00"), &at("23:00")).await,
        Err(EngineError::AmenityNotFound(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn restart_replays_state_and_user_constraints() {
    let path = test_wal_path("restart.wal");
    let pool = amenity("Pool", 1, false);
    let room = amenity("Party room", 1, true);
    let owner = resident();
    let desk = admin();

    let (kept, hidden, pending) = {
        let (engine, _rx) = start_engine(path.clone(), &[pool.clone(), room.clone()]);
        let kept = book(&engine, &owner, &pool, &at("09:00"), &at("10:00")).await.unwrap();
        let hidden = book(&engine, &owner, &room, &at("12:00"), &at("13:00")).await.unwrap();
        engine.reject(&desk, hidden.id, Some("closed")).await.unwrap();
        engine.hide_reservation(&owner, hidden.id).await.unwrap();
        let pending = book(&engine, &resident(), &room, &at("14:00"), &at("15:00")).await.unwrap();
        (kept, hidden, pending)
    };

    let (engine, _rx) = start_engine(path, &[pool.clone(), room.clone()]);
    assert_eq!(engine.reservation_count(), 3);
    let hidden = engine.get_reservation(&owner, hidden.id).await.unwrap();
    assert_eq!(hidden.status, ReservationStatus::Cancelled);
    assert_eq!(hidden.reason.as_deref(), Some("closed"));
    assert!(hidden.hidden);
    assert_eq!(engine.list_pending(&desk).await.unwrap()[0].id, pending.id);

    // Per-user index was rebuilt: the same-day rule still holds for the replayed booking.
    let err = book(&engine, &owner, &pool, &at("17:00"), &at("18:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDailyBooking(id) if id == kept.id));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let pool = open_all_day("Pool", 4, false);
    let desk = admin();
    let mut ids = Vec::new();
    {
        let (engine, _rx) = start_engine(path.clone(), std::slice::from_ref(&pool));
        for hour in 0..8 {
            let start = format!("2030-03-04T{:02}:00:00-03:00", hour * 2);
            let end = format!("2030-03-04T{:02}:30:00-03:00", hour * 2);
            let r = book(&engine, &resident(), &pool, &start, &end).await.unwrap();
            if hour % 2 == 0 {
                engine.admin_cancel(&desk, r.id, Some("drained")).await.unwrap();
            }
            ids.push(r.id);
        }
        assert_eq!(engine.appends_since_compact().await.unwrap(), 12);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.appends_since_compact().await.unwrap(), 0);
        // Appends after compaction land in the new file.
        book(&engine, &resident(), &pool, &at("20:00"), &at("21:00")).await.unwrap();
    }

    let (engine, _rx) = start_engine(path, std::slice::from_ref(&pool));
    assert_eq!(engine.reservation_count(), 9);
    for (i, id) in ids.iter().enumerate() {
        let r = engine.get_reservation(&desk, *id).await.unwrap();
        if i % 2 == 0 {
            assert_eq!(r.status, ReservationStatus::Cancelled);
            assert_eq!(r.reason.as_deref(), Some("drained"));
        } else {
            assert_eq!(r.status, ReservationStatus::Confirmed);
        }
    }
}

#[tokio::test]
async fn store_failure_changes_nothing() {
    let pool = amenity("Pool", 1, false);
    let (mut engine, mut rx) = start_engine(test_wal_path("store_down.wal"), std::slice::from_ref(&pool));
    engine.wal = WalHandle::closed();

    let err = book(&engine, &resident(), &pool, &at("09:00"), &at("10:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert_eq!(err.kind().http_status(), 500);
    assert_eq!(engine.reservation_count(), 0);
    assert!(drain(&mut rx).is_empty());
    assert!(engine.finalize_expired(now_ms()).await.is_ok());
}

#[tokio::test]
async fn sweep_retries_after_store_failure() {
    let gym = open_all_day("Gym", 4, false);
    let (mut engine, _rx) = start_engine(test_wal_path("sweep_store_down.wal"), std::slice::from_ref(&gym));
    let who = resident();
    let now = now_ms();
    let r = engine
        .create_reservation(
            &who,
            Ulid::new(),
            gym.id,
            &(now - 90 * M).to_string(),
            &(now - 30 * M).to_string(),
        )
        .await
        .unwrap();

    let live = std::mem::replace(&mut engine.wal, WalHandle::closed());
    let err = engine.finalize_expired(now).await.unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert_eq!(crate::sweep::sweep_once(&engine, now).await, 0);
    assert_eq!(
        engine.get_reservation(&who, r.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );
    // The owner's ledger still holds the slot.
    let owner = engine.users.get(&who.user_id).map(|e| e.value().clone()).unwrap();
    assert!(owner.lock().await.overlapping(&r.span, None).is_some());

    engine.wal = live;
    assert_eq!(crate::sweep::sweep_once(&engine, now).await, 1);
    assert_eq!(
        engine.get_reservation(&who, r.id).await.unwrap().status,
        ReservationStatus::Finalized
    );
}

#[tokio::test]
async fn failed_create_releases_its_id() {
    let pool = amenity("Pool", 1, false);
    let (mut engine, _rx) = start_engine(test_wal_path("release_id.wal"), std::slice::from_ref(&pool));
    let who = resident();
    let id = Ulid::new();

    let err = engine
        .create_reservation(&who, id, pool.id, &at("23:00"), &at("23:30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutsideOperatingHours { .. }));
    assert!(engine.locate(&id).is_none());

    let live = std::mem::replace(&mut engine.wal, WalHandle::closed());
    let err = engine
        .create_reservation(&who, id, pool.id, &at("09:00"), &at("09:30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert!(engine.locate(&id).is_none());

    engine.wal = live;
    let r = engine
        .create_reservation(&who, id, pool.id, &at("09:00"), &at("09:30"))
        .await
        .unwrap();
    assert_eq!(r.id, id);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_id_on_two_amenities_commits_once() {
    let gym = open_all_day("Gym", 50, false);
    let pool = open_all_day("Pool", 50, false);
    let (engine, _rx) = start_engine(
        test_wal_path("same_id_race.wal"),
        &[gym.clone(), pool.clone()],
    );
    let engine = Arc::new(engine);

    for round in 0..20 {
        let id = Ulid::new();
        let start = format!("2030-03-{:02}T10:00:00-03:00", round + 5);
        let end = format!("2030-03-{:02}T11:00:00-03:00", round + 5);
        let handles: Vec<_> = [gym.id, pool.id]
            .into_iter()
            .map(|amenity_id| {
                let engine = engine.clone();
                let (start, end) = (start.clone(), end.clone());
                let who = resident();
                tokio::spawn(async move {
                    let result = engine.create_reservation(&who, id, amenity_id, &start, &end).await;
                    (who, result)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for h in handles {
            let (who, result) = h.await.unwrap();
            match result {
                Ok(r) => winners.push((who, r)),
                Err(e) => assert!(matches!(e, EngineError::AlreadyExists(x) if x == id), "round {round}: {e}"),
            }
        }
        assert_eq!(winners.len(), 1, "round {round}");
        let (who, won) = &winners[0];
        assert_eq!(engine.locate(&id).unwrap().amenity_id, won.amenity_id);
        assert_eq!(&engine.get_reservation(who, id).await.unwrap(), won);
    }
    assert_eq!(engine.reservation_count(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_never_oversell() {
    let room = amenity("Party room", 1, true);
    let (engine, _rx) = start_engine(test_wal_path("approval_race.wal"), std::slice::from_ref(&room));
    let engine = Arc::new(engine);
    let desk = admin();

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(book(&engine, &resident(), &room, &at("09:00"), &at("10:00")).await.unwrap().id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let engine = engine.clone();
            let id = *id;
            tokio::spawn(async move { engine.approve(&desk, id).await })
        })
        .collect();

    let mut approved = 0;
    for h in handles {
        if !h.await.unwrap().unwrap().auto_rejected() {
            approved += 1;
        }
    }
    assert_eq!(approved, 1);
    let occ = engine.occupancy(room.id, &at("09:00"), &at("10:00")).await.unwrap();
    assert_eq!(occ.confirmed, 1);
}

fn assert_invariants(all: &[Reservation], amenities: &[Amenity]) {
    let zone = BuildingZone::default();
    let confirmed: Vec<&Reservation> = all
        .iter()
        .filter(|r| r.status == ReservationStatus::Confirmed)
        .collect();

    for a in amenities {
        let mine: Vec<&&Reservation> = confirmed.iter().filter(|r| r.amenity_id == a.id).collect();
        for probe in &mine {
            let t = probe.span.start;
            let load = mine.iter().filter(|r| r.span.contains_instant(t)).count();
            assert!(load as u32 <= a.capacity, "{} over capacity at {t}", a.name);
        }
    }

    for (i, x) in confirmed.iter().enumerate() {
        for y in &confirmed[i + 1..] {
            if x.user_id != y.user_id {
                continue;
            }
            assert!(!x.span.overlaps(&y.span), "user {} double-booked", x.user_id);
            if x.amenity_id == y.amenity_id {
                assert_ne!(
                    zone.local_day(x.span.start),
                    zone.local_day(y.span.start),
                    "user {} booked the same amenity twice in a day",
                    x.user_id
                );
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_interleavings_keep_invariants() {
    let amenities = vec![
        open_all_day("Pool", 2, false),
        open_all_day("Grill", 1, false),
        open_all_day("Party room", 1, true),
    ];
    let base: Ms = 1_900_000_000_000;

    for seed in 0..8u64 {
        let (engine, _rx) = start_engine(
            test_wal_path(&format!("random_{seed}.wal")),
            &amenities,
        );
        let engine = Arc::new(engine);
        let mut rng = StdRng::seed_from_u64(seed);
        let users: Vec<Principal> = (0..6).map(|_| resident()).collect();

        let mut handles = Vec::new();
        for _ in 0..60 {
            let who = users[rng.gen_range(0..users.len())];
            let amenity_id = amenities[rng.gen_range(0..amenities.len())].id;
            let start = base + rng.gen_range(0..96) * 30 * M;
            let end = start + rng.gen_range(1..=4) * 30 * M;
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let _ = engine
                    .create_reservation(&who, Ulid::new(), amenity_id, &start.to_string(), &end.to_string())
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let desk = admin();
        let pending = engine.list_pending(&desk).await.unwrap();
        let approvals: Vec<_> = pending
            .into_iter()
            .map(|r| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.approve(&desk, r.id).await })
            })
            .collect();
        for h in approvals {
            h.await.unwrap().unwrap();
        }

        let mut all = Vec::new();
        for who in &users {
            all.extend(engine.list_own(who).await);
        }
        assert_invariants(&all, &amenities);
    }
}
