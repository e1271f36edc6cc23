use super::*;
use crate::limits::*;
use tokio_test::{assert_err, assert_ok};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const GRACE: Ms = 15 * M;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), GRACE).unwrap()
}

/// A facility "P1" with the given floors `(number, class, slot_count)` and a
/// four-wheel tariff of 5000 first hour + 3000 per started hour.
async fn setup_lot(engine: &Engine, floors: &[(u32, VehicleClass, u32)]) -> Ulid {
    let facility = Ulid::new();
    let capacity = floors.iter().map(|f| f.2).sum();
    assert_ok!(engine.register_facility(facility, "p1", Some("Plaza".into()), capacity).await);
    for &(number, class, count) in floors {
        assert_ok!(engine.register_floor(Ulid::new(), facility, number, class, count).await);
    }
    assert_ok!(engine.set_tariff(facility, VehicleClass::FourWheel, 5000, 3000).await);
    facility
}

async fn car(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    assert_ok!(engine.register_vehicle(id, &format!("B {id}"), VehicleClass::FourWheel).await);
    id
}

fn request(facility_id: Ulid, vehicle_id: Ulid, window_start: Ms, hours: u32) -> AssignRequest {
    AssignRequest {
        facility_id,
        vehicle_id,
        user_id: "user-1".into(),
        vehicle_class: VehicleClass::FourWheel,
        window_start,
        duration_hours: hours,
    }
}

fn future() -> Ms {
    now_ms() + H
}

async fn slot_status_of(engine: &Engine, slot_id: Ulid) -> SlotStatus {
    engine.get_slot(&slot_id).unwrap().read().await.status()
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn catalog_generates_ordered_slot_codes() {
    let engine = new_engine("catalog_codes.wal");
    let facility = setup_lot(
        &engine,
        &[(2, VehicleClass::FourWheel, 2), (1, VehicleClass::TwoWheel, 3)],
    )
    .await;

    let rows = assert_ok!(engine.slot_status(facility).await);
    let codes: Vec<&str> = rows.iter().map(|r| r.slot_code.as_str()).collect();
    assert_eq!(
        codes,
        vec!["P1-01-0001", "P1-01-0002", "P1-01-0003", "P1-02-0001", "P1-02-0002"]
    );
    assert!(rows.iter().all(|r| r.status == SlotStatus::Available));
    assert_eq!(rows[0].vehicle_class, VehicleClass::TwoWheel);
    assert_eq!(rows[4].floor_number, 2);
}

#[tokio::test]
async fn catalog_rejects_duplicates_and_overflow() {
    let engine = new_engine("catalog_dupes.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;

    let err = assert_err!(engine.register_facility(Ulid::new(), "P1", None, 5).await);
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == facility));

    let err = assert_err!(
        engine
            .register_floor(Ulid::new(), facility, 1, VehicleClass::FourWheel, 1)
            .await
    );
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    // Capacity was exactly 2.
    let err = assert_err!(
        engine
            .register_floor(Ulid::new(), facility, 2, VehicleClass::FourWheel, 1)
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let err = assert_err!(
        engine
            .register_floor(Ulid::new(), Ulid::new(), 1, VehicleClass::FourWheel, 1)
            .await
    );
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Allocation ───────────────────────────────────────────

#[tokio::test]
async fn assign_is_first_fit_by_floor_then_code() {
    let engine = new_engine("assign_first_fit.wal");
    let facility = setup_lot(
        &engine,
        &[(3, VehicleClass::FourWheel, 2), (1, VehicleClass::FourWheel, 2)],
    )
    .await;

    let mut codes = Vec::new();
    for _ in 0..4 {
        let v = car(&engine).await;
        let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
        codes.push(a.slot_code);
    }
    assert_eq!(codes, vec!["P1-01-0001", "P1-01-0002", "P1-03-0001", "P1-03-0002"]);

    let v = car(&engine).await;
    let err = assert_err!(engine.assign(request(facility, v, future(), 1)).await);
    assert!(matches!(err, EngineError::NoAvailableSlot { .. }));
    assert_eq!(err.user_message(), "no slot currently available for this vehicle type");
}

#[tokio::test]
async fn assign_reuses_freed_slot_deterministically() {
    let engine = new_engine("assign_deterministic.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 3)]).await;

    let v1 = car(&engine).await;
    let v2 = car(&engine).await;
    let a1 = assert_ok!(engine.assign(request(facility, v1, future(), 1)).await);
    let a2 = assert_ok!(engine.assign(request(facility, v2, future(), 1)).await);
    assert_eq!(a1.slot_code, "P1-01-0001");
    assert_eq!(a2.slot_code, "P1-01-0002");

    assert_ok!(engine.cancel_booking(a1.booking_id).await);
    let v3 = car(&engine).await;
    let a3 = assert_ok!(engine.assign(request(facility, v3, future(), 1)).await);
    assert_eq!(a3.slot_code, "P1-01-0001");
}

#[tokio::test]
async fn concurrent_assign_takes_both_slots() {
    let engine = Arc::new(new_engine("assign_concurrent_two.wal"));
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;
    let v1 = car(&engine).await;
    let v2 = car(&engine).await;
    let start = future();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let h1 = tokio::spawn(async move { e1.assign(request(facility, v1, start, 1)).await });
    let h2 = tokio::spawn(async move { e2.assign(request(facility, v2, start, 1)).await });
    let a1 = assert_ok!(h1.await.unwrap());
    let a2 = assert_ok!(h2.await.unwrap());

    assert_ne!(a1.slot_id, a2.slot_id);
    let occupancy = assert_ok!(engine.occupancy(facility).await);
    assert_eq!(occupancy.available, 0);
    assert_eq!(occupancy.reserved, 2);
    for a in [&a1, &a2] {
        let r = engine.get_reservation(&a.reservation_id).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Active);
    }
}

#[tokio::test]
async fn concurrent_assign_never_double_allocates() {
    let engine = Arc::new(new_engine("assign_concurrent_many.wal"));
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 5)]).await;
    let start = future();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let v = car(&engine).await;
        let e = engine.clone();
        handles.push(tokio::spawn(async move { e.assign(request(facility, v, start, 2)).await }));
    }
    let mut won = Vec::new();
    let mut lost = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(a) => won.push(a.slot_id),
            Err(EngineError::NoAvailableSlot { .. }) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won.len(), 5);
    assert_eq!(lost, 7);
    won.sort();
    won.dedup();
    assert_eq!(won.len(), 5, "a slot was handed out twice");

    for slot_id in won {
        let rs = assert_ok!(engine.reservations_for_slot(&slot_id).await);
        let active: Vec<_> = rs.iter().filter(|r| r.status == ReservationStatus::Active).collect();
        assert_eq!(active.len(), 1);
    }
}

#[tokio::test]
async fn open_transaction_blocks_second_assign() {
    let engine = new_engine("assign_open_tx.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 3)]).await;
    let v = car(&engine).await;

    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    let err = assert_err!(engine.assign(request(facility, v, future() + 5 * H, 1)).await);
    assert!(matches!(err, EngineError::Conflict(ConflictKind::OpenTransaction(tx)) if tx == a.transaction_id));
    assert_eq!(err.user_message(), "you already have an active parking session");

    let entry = future();
    assert_ok!(engine.confirm_entry(a.booking_id, entry).await);
    assert_err!(engine.assign(request(facility, v, future() + 5 * H, 1)).await);
    assert_eq!(engine.open_transactions(&v).len(), 1);

    assert_ok!(engine.confirm_exit(a.booking_id, entry + 30 * M).await);
    assert!(engine.open_transactions(&v).is_empty());
    assert_ok!(engine.assign(request(facility, v, future() + 5 * H, 1)).await);
    assert_eq!(engine.open_transactions(&v).len(), 1);
}

#[tokio::test]
async fn assign_precondition_failures() {
    let engine = new_engine("assign_preconditions.wal");
    let facility = setup_lot(
        &engine,
        &[(1, VehicleClass::FourWheel, 1), (2, VehicleClass::TwoWheel, 1)],
    )
    .await;
    let v = car(&engine).await;

    // No oversize floor.
    let mut req = request(facility, v, future(), 1);
    req.vehicle_class = VehicleClass::Oversize;
    let err = assert_err!(engine.assign(req).await);
    assert!(matches!(err, EngineError::VehicleClassMismatch { .. }));

    let bus = Ulid::new();
    assert_ok!(engine.register_vehicle(bus, "B 7001 TX", VehicleClass::Oversize).await);
    let mut req = request(facility, bus, future(), 1);
    req.vehicle_class = VehicleClass::Oversize;
    let err = assert_err!(engine.assign(req).await);
    assert!(matches!(err, EngineError::NoEligibleFloor { .. }));

    let err = assert_err!(engine.assign(request(facility, Ulid::new(), future(), 1)).await);
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = assert_err!(engine.assign(request(facility, v, future(), 0)).await);
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    let err = assert_err!(
        engine
            .assign(request(facility, v, future(), MAX_DURATION_HOURS + 1))
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    // Floor in maintenance is not eligible.
    let floor_id = engine.catalog.floors_of(&facility)[0].id;
    assert_ok!(engine.set_floor_status(floor_id, FloorStatus::Maintenance).await);
    let err = assert_err!(engine.assign(request(facility, v, future(), 1)).await);
    assert!(matches!(err, EngineError::NoEligibleFloor { .. }));
    assert_ok!(engine.set_floor_status(floor_id, FloorStatus::Active).await);

    // Closed facility has no eligible floors.
    assert_ok!(engine.set_facility_open(facility, false).await);
    let err = assert_err!(engine.assign(request(facility, v, future(), 1)).await);
    assert!(matches!(err, EngineError::NoEligibleFloor { .. }));
    assert_ok!(engine.set_facility_open(facility, true).await);
    assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
}

#[tokio::test]
async fn assign_skips_slots_in_maintenance() {
    let engine = new_engine("assign_skip_maintenance.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;
    let first = engine.slot_status(facility).await.unwrap()[0].slot_id;

    assert!(assert_ok!(
        engine
            .claim_slot(first, SlotStatus::Available, SlotStatus::Maintenance)
            .await
    ));
    // Lost CAS: no side effect.
    assert!(!assert_ok!(
        engine
            .claim_slot(first, SlotStatus::Available, SlotStatus::Reserved)
            .await
    ));
    assert_eq!(assert_ok!(engine.occupancy(facility).await).maintenance, 1);

    let v = car(&engine).await;
    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    assert_eq!(a.slot_code, "P1-01-0002");

    assert_eq!(assert_ok!(engine.release_slot(first).await), SlotStatus::Maintenance);
    assert_eq!(slot_status_of(&engine, first).await, SlotStatus::Available);
}

// ── Booking lifecycle ────────────────────────────────────

#[tokio::test]
async fn exit_cost_tiers() {
    let engine = new_engine("lifecycle_cost.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 3)]).await;
    let entry = future();

    for (stay, expected) in [(30 * M, 5000), (60 * M, 5000), (90 * M, 8000)] {
        let v = car(&engine).await;
        let a = assert_ok!(engine.assign(request(facility, v, entry, 2)).await);
        assert_ok!(engine.confirm_entry(a.booking_id, entry).await);
        let receipt = assert_ok!(engine.confirm_exit(a.booking_id, entry + stay).await);
        assert_eq!(receipt.cost, expected, "stay of {stay}ms");
        assert_eq!(receipt.booking.status, BookingStatus::Completed);
        assert_eq!(receipt.transaction.exit_time, Some(entry + stay));
        assert_eq!(receipt.transaction.cost, Some(expected));
    }
}

#[tokio::test]
async fn entry_and_exit_drive_slot_status() {
    let engine = new_engine("lifecycle_slot_status.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Booked);
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Reserved);

    let entry = future();
    let booking = assert_ok!(engine.confirm_entry(a.booking_id, entry).await);
    assert_eq!(booking.status, BookingStatus::Active);
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Occupied);
    assert_eq!(engine.get_transaction(&a.transaction_id).unwrap().entry_time, entry);
    let r = engine.get_reservation(&a.reservation_id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Fulfilled);

    assert_ok!(engine.confirm_exit(a.booking_id, entry + 2 * H).await);
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Available);
}

#[tokio::test]
async fn terminal_states_reject_transitions() {
    let engine = new_engine("lifecycle_terminal.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    let entry = future();

    // booked → completed is not a transition.
    let err = assert_err!(engine.confirm_exit(a.booking_id, entry).await);
    assert!(matches!(err, EngineError::InvalidTransition { from: "booked", to: "completed", .. }));

    assert_ok!(engine.confirm_entry(a.booking_id, entry).await);
    assert_err!(engine.confirm_entry(a.booking_id, entry).await);
    assert_ok!(engine.confirm_exit(a.booking_id, entry + H).await);

    for result in [
        engine.cancel_booking(a.booking_id).await.map(|_| ()),
        engine.confirm_entry(a.booking_id, entry).await.map(|_| ()),
        engine.confirm_exit(a.booking_id, entry + 2 * H).await.map(|_| ()),
    ] {
        let err = assert_err!(result);
        assert!(matches!(err, EngineError::InvalidTransition { from: "completed", .. }));
    }
    assert!(!assert_ok!(engine.expire_booking(a.booking_id, entry + 10 * H).await));
    assert!(matches!(
        assert_err!(engine.cancel_booking(Ulid::new()).await),
        EngineError::NotFound(_)
    ));
}

#[tokio::test]
async fn cancel_releases_everything() {
    let engine = new_engine("lifecycle_cancel.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;

    // Cancel from booked.
    let v1 = car(&engine).await;
    let a1 = assert_ok!(engine.assign(request(facility, v1, future(), 1)).await);
    let booking = assert_ok!(engine.cancel_booking(a1.booking_id).await);
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(slot_status_of(&engine, a1.slot_id).await, SlotStatus::Available);
    let r = engine.get_reservation(&a1.reservation_id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Cancelled);
    let tx = engine.get_transaction(&a1.transaction_id).unwrap();
    assert!(tx.exit_time.is_some());
    assert_eq!(tx.cost, None);
    assert!(engine.open_transactions(&v1).is_empty());

    // Cancel from active.
    let v2 = car(&engine).await;
    let a2 = assert_ok!(engine.assign(request(facility, v2, future(), 1)).await);
    assert_ok!(engine.confirm_entry(a2.booking_id, future()).await);
    assert_ok!(engine.cancel_booking(a2.booking_id).await);
    assert_eq!(slot_status_of(&engine, a2.slot_id).await, SlotStatus::Available);
    assert!(engine.open_transactions(&v2).is_empty());
    assert_eq!(assert_ok!(engine.occupancy(facility).await).available, 2);
}

#[tokio::test]
async fn exit_validation_leaves_state_untouched() {
    let engine = new_engine("lifecycle_exit_validation.wal");
    let facility = Ulid::new();
    assert_ok!(engine.register_facility(facility, "NT", None, 1).await);
    assert_ok!(
        engine
            .register_floor(Ulid::new(), facility, 1, VehicleClass::FourWheel, 1)
            .await
    );
    let v = car(&engine).await;
    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    let entry = future();
    assert_ok!(engine.confirm_entry(a.booking_id, entry).await);

    let err = assert_err!(engine.confirm_exit(a.booking_id, entry - 1).await);
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    let err = assert_err!(engine.confirm_exit(a.booking_id, entry + H).await);
    assert!(matches!(err, EngineError::NoTariff { .. }));

    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Active);
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Occupied);
    assert_eq!(engine.open_transactions(&v).len(), 1);

    assert_ok!(engine.set_tariff(facility, VehicleClass::FourWheel, 100, 50).await);
    let receipt = assert_ok!(engine.confirm_exit(a.booking_id, entry + 3 * H).await);
    assert_eq!(receipt.cost, 200);
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn standalone_reservation_claims_and_conflicts() {
    let engine = new_engine("reservation_standalone.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let slot = engine.slot_status(facility).await.unwrap()[0].slot_id;
    let v = car(&engine).await;
    let start = future();

    let r = assert_ok!(
        engine
            .create_reservation(slot, v, "user-1", Span::new(start, start + H), 30 * M)
            .await
    );
    assert_eq!(r.expires_at, start + 30 * M);
    assert_eq!(slot_status_of(&engine, slot).await, SlotStatus::Reserved);

    let err = assert_err!(
        engine
            .create_reservation(slot, v, "user-2", Span::new(start + 30 * M, start + 2 * H), 30 * M)
            .await
    );
    assert!(matches!(err, EngineError::Conflict(ConflictKind::Overlap(id)) if id == r.id));

    // Touching window: no overlap, but the slot is still held.
    let err = assert_err!(
        engine
            .create_reservation(slot, v, "user-2", Span::new(start + H, start + 2 * H), 30 * M)
            .await
    );
    assert!(matches!(err, EngineError::Conflict(ConflictKind::SlotUnavailable(_))));

    assert!(assert_ok!(engine.find_conflict(slot, start + 59 * M, start + 2 * H).await).is_some());
    assert!(assert_ok!(engine.find_conflict(slot, start + H, start + 2 * H).await).is_none());
}

#[tokio::test]
async fn expire_is_idempotent() {
    let engine = new_engine("reservation_expire_idempotent.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let slot = engine.slot_status(facility).await.unwrap()[0].slot_id;
    let v = car(&engine).await;
    let start = future();
    let r = assert_ok!(
        engine
            .create_reservation(slot, v, "user-1", Span::new(start, start + H), GRACE)
            .await
    );

    assert!(assert_ok!(engine.expire_reservation(r.id).await));
    assert!(!assert_ok!(engine.expire_reservation(r.id).await));
    assert_eq!(slot_status_of(&engine, slot).await, SlotStatus::Available);
    assert_eq!(
        engine.get_reservation(&r.id).await.unwrap().status,
        ReservationStatus::Expired
    );
    assert!(matches!(
        assert_err!(engine.expire_reservation(Ulid::new()).await),
        EngineError::NotFound(_)
    ));
}

#[tokio::test]
async fn cancel_reservation_releases_slot() {
    let engine = new_engine("reservation_cancel.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let slot = engine.slot_status(facility).await.unwrap()[0].slot_id;
    let v = car(&engine).await;
    let start = future();
    let r = assert_ok!(
        engine
            .create_reservation(slot, v, "user-1", Span::new(start, start + H), GRACE)
            .await
    );

    let cancelled = assert_ok!(engine.cancel_reservation(r.id).await);
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(slot_status_of(&engine, slot).await, SlotStatus::Available);
    let err = assert_err!(engine.cancel_reservation(r.id).await);
    assert!(matches!(err, EngineError::InvalidTransition { entity: "reservation", .. }));
}

#[tokio::test]
async fn cancel_reservation_of_booking_cancels_booking() {
    let engine = new_engine("reservation_cancel_booking.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);

    let r = assert_ok!(engine.cancel_reservation(a.reservation_id).await);
    assert_eq!(r.status, ReservationStatus::Cancelled);
    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Cancelled);
    assert!(engine.open_transactions(&v).is_empty());
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Available);
}

#[tokio::test]
async fn booking_expires_only_after_grace() {
    let engine = new_engine("reservation_booking_expiry.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let start = future();
    let a = assert_ok!(engine.assign(request(facility, v, start, 2)).await);
    assert_eq!(a.expires_at, start + GRACE);

    // Not lapsed yet: nothing happens.
    assert!(!assert_ok!(engine.expire_reservation_at(a.reservation_id, start + GRACE).await));
    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Booked);

    let later = start + GRACE + 1;
    assert!(assert_ok!(engine.expire_reservation_at(a.reservation_id, later).await));
    assert!(!assert_ok!(engine.expire_reservation_at(a.reservation_id, later).await));

    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Expired);
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Available);
    assert!(engine.open_transactions(&v).is_empty());
    let rs = assert_ok!(engine.reservations_for_slot(&a.slot_id).await);
    assert!(rs.iter().all(|r| r.status != ReservationStatus::Active));
}

#[tokio::test]
async fn entered_booking_never_expires() {
    let engine = new_engine("reservation_entered_no_expiry.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let start = future();
    let a = assert_ok!(engine.assign(request(facility, v, start, 1)).await);
    assert_ok!(engine.confirm_entry(a.booking_id, start).await);

    assert!(!assert_ok!(engine.expire_reservation_at(a.reservation_id, start + 10 * H).await));
    assert!(engine.collect_lapsed_reservations(start + 10 * H).is_empty());
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Occupied);
}

#[tokio::test]
async fn lapsed_reservation_is_logically_expired() {
    let engine = new_engine("reservation_logical_expiry.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let slot = engine.slot_status(facility).await.unwrap()[0].slot_id;
    let v = car(&engine).await;
    let start = now_ms() - 2 * H;
    let r = assert_ok!(
        engine
            .create_reservation(slot, v, "user-1", Span::new(start, start + 4 * H), 0)
            .await
    );

    // Past expires_at: reads as expired and no longer conflicts, before any sweep.
    assert_eq!(
        engine.get_reservation(&r.id).await.unwrap().status,
        ReservationStatus::Expired
    );
    assert!(assert_ok!(engine.find_conflict(slot, start, start + H).await).is_none());
    assert_eq!(engine.collect_lapsed_reservations(now_ms()), vec![r.id]);

    assert!(assert_ok!(engine.expire_reservation(r.id).await));
    assert!(engine.collect_lapsed_reservations(now_ms()).is_empty());
    assert_eq!(slot_status_of(&engine, slot).await, SlotStatus::Available);
}

// ── Orphans ──────────────────────────────────────────────

#[tokio::test]
async fn overdue_transactions_are_flagged_not_closed() {
    let engine = new_engine("orphan_flag.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;
    let start = now_ms() - 80 * H;
    let a = assert_ok!(engine.assign(request(facility, v, start, 1)).await);
    assert_ok!(engine.confirm_entry(a.booking_id, start).await);

    let now = now_ms();
    assert_eq!(engine.collect_overdue_transactions(now, 72 * H), vec![a.transaction_id]);
    assert!(engine.collect_overdue_transactions(now, 100 * H).is_empty());

    assert!(assert_ok!(engine.flag_transaction(a.transaction_id, now).await));
    assert!(!assert_ok!(engine.flag_transaction(a.transaction_id, now).await));
    assert!(engine.collect_overdue_transactions(now, 72 * H).is_empty());

    let flagged = engine.flagged_transactions();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].flagged_at, Some(now));
    assert!(flagged[0].is_open());
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Occupied);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("durability_replay.wal");
    let (facility, v, a_open, a_done);
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), GRACE).unwrap();
        facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 4)]).await;
        v = car(&engine).await;
        let other = car(&engine).await;
        let entry = future();
        a_done = assert_ok!(engine.assign(request(facility, other, entry, 1)).await);
        assert_ok!(engine.confirm_entry(a_done.booking_id, entry).await);
        assert_ok!(engine.confirm_exit(a_done.booking_id, entry + 90 * M).await);
        a_open = assert_ok!(engine.assign(request(facility, v, entry, 1)).await);
        assert_ok!(engine.confirm_entry(a_open.booking_id, entry).await);
        let maintenance_slot = engine.slot_status(facility).await.unwrap()[3].slot_id;
        assert_ok!(
            engine
                .claim_slot(maintenance_slot, SlotStatus::Available, SlotStatus::Maintenance)
                .await
        );
        assert_ok!(engine.set_facility_open(facility, false).await);
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), GRACE).unwrap();
    let occupancy = assert_ok!(engine.occupancy(facility).await);
    assert_eq!(occupancy.occupied, 1);
    assert_eq!(occupancy.maintenance, 1);
    assert_eq!(occupancy.available, 2);
    assert!(!engine.get_facility(&facility).unwrap().open);

    let done = engine.get_transaction(&a_done.transaction_id).unwrap();
    assert_eq!(done.cost, Some(8000));
    assert_eq!(engine.get_booking(&a_open.booking_id).unwrap().status, BookingStatus::Active);
    assert_eq!(engine.open_transactions(&v).len(), 1);
    assert_eq!(
        engine.get_vehicle(&v).unwrap().read().await.open_transaction,
        Some(a_open.transaction_id)
    );
    assert!(engine.get_tariff(facility, VehicleClass::FourWheel).is_some());
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("durability_compaction.wal");
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), GRACE).unwrap();
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;
    let v = car(&engine).await;

    // Churn: many assign/cancel cycles.
    for _ in 0..20 {
        let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
        assert_ok!(engine.cancel_booking(a.booking_id).await);
    }
    let open = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    let slot = engine.slot_status(facility).await.unwrap()[1].slot_id;
    let standalone = assert_ok!(
        engine
            .create_reservation(slot, v, "user-9", Span::new(future(), future() + H), GRACE)
            .await
    );
    let before_rows = assert_ok!(engine.slot_status(facility).await);
    assert!(engine.wal_appends_since_compact().await > 0);

    assert_ok!(engine.compact_wal().await);
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), GRACE).unwrap();
    assert_eq!(assert_ok!(engine.slot_status(facility).await), before_rows);
    assert_eq!(engine.get_booking(&open.booking_id).unwrap().status, BookingStatus::Booked);
    assert_eq!(engine.open_transactions(&v).len(), 1);
    let r = engine.get_reservation(&standalone.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Active);

    // The restored ledger is live: the booking can still move on.
    assert_ok!(engine.cancel_reservation(open.reservation_id).await);
    assert!(engine.open_transactions(&v).is_empty());
    assert_ok!(engine.cancel_reservation(standalone.id).await);
    assert_eq!(assert_ok!(engine.occupancy(facility).await).available, 2);
}

#[tokio::test]
async fn status_changes_are_broadcast() {
    let engine = new_engine("notify_broadcast.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let mut rx = engine.notify.subscribe(facility);
    let v = car(&engine).await;

    let a = assert_ok!(engine.assign(request(facility, v, future(), 1)).await);
    let update = rx.recv().await.unwrap();
    assert_eq!(update.slot_id, a.slot_id);
    assert_eq!(update.status, SlotStatus::Reserved);

    assert_ok!(engine.cancel_booking(a.booking_id).await);
    assert_eq!(rx.recv().await.unwrap().status, SlotStatus::Available);
}

// ── Arithmetic bounds ────────────────────────────────────

#[tokio::test]
async fn assign_rejects_out_of_range_start() {
    let engine = new_engine("bounds_window_start.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;
    let v = car(&engine).await;

    for start in [Ms::MAX - 10, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS - H] {
        let err = assert_err!(engine.assign(request(facility, v, start, 1)).await);
        assert!(matches!(err, EngineError::LimitExceeded(_)), "start {start}: {err}");
    }
    assert!(engine.bookings.is_empty());
    assert_eq!(assert_ok!(engine.occupancy(facility).await).available, 1);
}

#[tokio::test]
async fn tariff_rates_are_bounded_and_cost_never_wraps() {
    let engine = new_engine("bounds_tariff.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 1)]).await;

    let err = assert_err!(
        engine
            .set_tariff(facility, VehicleClass::FourWheel, 5000, Money::MAX / 2)
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let tariff = engine.get_tariff(facility, VehicleClass::FourWheel).unwrap();
    assert_eq!(tariff.per_hour_rate, 3000);

    assert_ok!(engine.set_tariff(facility, VehicleClass::FourWheel, 5000, MAX_RATE).await);
    let v = car(&engine).await;
    let entry = future();
    let a = assert_ok!(engine.assign(request(facility, v, entry, 1)).await);
    assert_ok!(engine.confirm_entry(a.booking_id, entry).await);

    // Decades at the maximum rate do not fit in Money.
    let err = assert_err!(engine.confirm_exit(a.booking_id, MAX_VALID_TIMESTAMP_MS).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert_eq!(engine.get_booking(&a.booking_id).unwrap().status, BookingStatus::Active);
    assert!(engine.get_transaction(&a.transaction_id).unwrap().is_open());
    assert_eq!(slot_status_of(&engine, a.slot_id).await, SlotStatus::Occupied);

    let receipt = assert_ok!(engine.confirm_exit(a.booking_id, entry + 3 * H).await);
    assert_eq!(receipt.cost, 5000 + 2 * MAX_RATE);
    assert!(receipt.cost > 0);
}

// ── Failed writes leave no trace ─────────────────────────

/// Replace the WAL writer with a channel nobody reads: every append fails.
fn break_wal(engine: &mut Engine) {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    engine.wal_tx = tx;
}

#[tokio::test]
async fn failed_assign_leaves_nothing_behind() {
    let mut engine = new_engine("rollback_assign.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;
    let v = car(&engine).await;
    let mut rx = engine.notify.subscribe(facility);
    break_wal(&mut engine);

    let err = assert_err!(engine.assign(request(facility, v, future(), 1)).await);
    assert!(matches!(err, EngineError::WalError(_)));

    let rows = assert_ok!(engine.slot_status(facility).await);
    assert!(rows.iter().all(|r| r.status == SlotStatus::Available));
    for row in &rows {
        assert!(assert_ok!(engine.reservations_for_slot(&row.slot_id).await).is_empty());
    }
    assert!(engine.bookings.is_empty());
    assert!(engine.transactions.is_empty());
    assert!(engine.reservation_bookings.is_empty());
    assert_eq!(engine.get_vehicle(&v).unwrap().read().await.open_transaction, None);
    assert!(engine.open_transactions(&v).is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn failed_cancel_and_exit_change_nothing() {
    let mut engine = new_engine("rollback_lifecycle.wal");
    let facility = setup_lot(&engine, &[(1, VehicleClass::FourWheel, 2)]).await;
    let booked_vehicle = car(&engine).await;
    let parked_vehicle = car(&engine).await;
    let booked = assert_ok!(engine.assign(request(facility, booked_vehicle, future(), 1)).await);
    let parked = assert_ok!(engine.assign(request(facility, parked_vehicle, future(), 1)).await);
    let entry = future();
    assert_ok!(engine.confirm_entry(parked.booking_id, entry).await);

    let before: Vec<_> = [&booked, &parked]
        .iter()
        .map(|a| {
            (
                engine.get_booking(&a.booking_id).unwrap(),
                engine.get_transaction(&a.transaction_id).unwrap(),
            )
        })
        .collect();
    break_wal(&mut engine);

    let err = assert_err!(engine.cancel_booking(booked.booking_id).await);
    assert!(matches!(err, EngineError::WalError(_)));
    let err = assert_err!(engine.confirm_exit(parked.booking_id, entry + H).await);
    assert!(matches!(err, EngineError::WalError(_)));

    for (a, (booking, transaction)) in [&booked, &parked].iter().zip(&before) {
        assert_eq!(&engine.get_booking(&a.booking_id).unwrap(), booking);
        assert_eq!(&engine.get_transaction(&a.transaction_id).unwrap(), transaction);
    }
    assert_eq!(slot_status_of(&engine, booked.slot_id).await, SlotStatus::Reserved);
    assert_eq!(slot_status_of(&engine, parked.slot_id).await, SlotStatus::Occupied);
    assert_eq!(
        engine.get_reservation(&booked.reservation_id).await.unwrap().status,
        ReservationStatus::Active
    );
    assert_eq!(engine.open_transactions(&booked_vehicle).len(), 1);
    assert_eq!(engine.open_transactions(&parked_vehicle).len(), 1);
}
