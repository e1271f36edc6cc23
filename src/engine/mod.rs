mod allocation;
mod catalog;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod reservations;
mod store;
#[cfg(test)]
mod tests;

pub use allocation::{AssignRequest, SlotAssignment};
pub use conflict::{find_conflict, now_ms};
pub use error::{ConflictKind, EngineError};
pub use lifecycle::ExitReceipt;
pub use store::SlotStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotifyHub, SlotUpdate};
use crate::wal::Wal;

use catalog::Catalog;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction or counters see the log.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the
    // next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's parking state: catalog, slots, vehicles and the booking ledger,
/// all rebuilt from the WAL on startup.
///
/// Lock order for mutations: `write_gate` (read) → vehicle → slot.
pub struct Engine {
    pub(super) catalog: Catalog,
    pub(super) slots: SlotStore,
    pub(super) vehicles: DashMap<Ulid, SharedVehicleState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) transactions: DashMap<Ulid, Transaction>,
    /// Reservation id → owning booking id.
    pub(super) reservation_bookings: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction.
    pub(super) write_gate: RwLock<()>,
    /// Serializes catalog ingestion (uniqueness checks).
    pub(super) catalog_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) reservation_grace_ms: Ms,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, reservation_grace_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            catalog: Catalog::default(),
            slots: SlotStore::new(),
            vehicles: DashMap::new(),
            bookings: DashMap::new(),
            transactions: DashMap::new(),
            reservation_bookings: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            notify,
            reservation_grace_ms,
        };

        // We are the sole owner of every lock here, so try_write never fails
        // unless the log is inconsistent. Never block: this may run inside an
        // async context (lazy tenant creation).
        for event in &events {
            let Some(slot_id) = event.slot_id() else {
                engine.apply_unlocked(event);
                continue;
            };
            let Some(slot_arc) = engine.slots.get_slot(&slot_id) else {
                warn!("replay: event for unknown slot {slot_id}, skipped");
                continue;
            };
            let mut slot = slot_arc
                .try_write()
                .map_err(|_| io::Error::other("replay: slot lock contended"))?;
            let vehicle_arc = engine
                .event_vehicle_id(event)
                .and_then(|vid| engine.get_vehicle(&vid));
            let mut vehicle = match vehicle_arc.as_ref() {
                Some(arc) => Some(
                    arc.try_write()
                        .map_err(|_| io::Error::other("replay: vehicle lock contended"))?,
                ),
                None => None,
            };
            engine.apply_locked(event, &mut slot, vehicle.as_deref_mut());
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get_slot(id)
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    /// WAL-append, apply under the caller's locks, notify listeners if the
    /// slot changed status. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        slot: &mut SlotState,
        vehicle: Option<&mut VehicleState>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let before = slot.status();
        self.apply_locked(event, slot, vehicle);
        if slot.status() != before {
            self.notify.send(SlotUpdate::of(slot));
        }
        Ok(())
    }

    pub(super) async fn persist_unlocked(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_unlocked(event);
        Ok(())
    }

    fn event_vehicle_id(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::SlotAssigned { transaction, .. } | Event::LedgerRestored { transaction, .. } => {
                Some(transaction.vehicle_id)
            }
            Event::ExitConfirmed { booking_id, .. }
            | Event::BookingCancelled { booking_id, .. }
            | Event::BookingExpired { booking_id, .. } => {
                self.bookings.get(booking_id).map(|b| b.vehicle_id)
            }
            _ => None,
        }
    }

    /// Catalog and ledger-annotation events; no slot or vehicle lock involved.
    fn apply_unlocked(&self, event: &Event) {
        match event {
            Event::FacilityRegistered {
                id,
                code,
                name,
                capacity,
            } => self.catalog.insert_facility(Facility {
                id: *id,
                code: code.clone(),
                name: name.clone(),
                capacity: *capacity,
                open: true,
            }),
            Event::FacilityOpenChanged { id, open } => {
                if let Some(mut facility) = self.catalog.facilities.get_mut(id) {
                    facility.open = *open;
                }
            }
            Event::FloorRegistered {
                id,
                facility_id,
                number,
                vehicle_class,
                slots,
            } => {
                self.catalog.insert_floor(Floor {
                    id: *id,
                    facility_id: *facility_id,
                    number: *number,
                    vehicle_class: *vehicle_class,
                    status: FloorStatus::Active,
                    slot_count: slots.len() as u32,
                });
                for (slot_id, code) in slots {
                    self.slots.insert_slot(SlotState::new(
                        *slot_id,
                        *id,
                        *facility_id,
                        code.clone(),
                        *vehicle_class,
                    ));
                }
            }
            Event::FloorStatusChanged { id, status } => {
                if let Some(mut floor) = self.catalog.floors.get_mut(id) {
                    floor.status = *status;
                }
            }
            Event::VehicleRegistered {
                id,
                plate,
                vehicle_class,
            } => {
                let vehicle = Vehicle {
                    id: *id,
                    plate: plate.clone(),
                    class: *vehicle_class,
                };
                self.vehicles
                    .insert(*id, Arc::new(RwLock::new(VehicleState::new(vehicle))));
            }
            Event::TariffSet { tariff } => {
                self.catalog
                    .tariffs
                    .insert((tariff.facility_id, tariff.vehicle_class), *tariff);
            }
            Event::TransactionFlagged { transaction_id, at } => {
                if let Some(mut tx) = self.transactions.get_mut(transaction_id) {
                    tx.flagged_at = Some(*at);
                }
            }
            other => warn!("slot-scoped event applied without lock: {other:?}"),
        }
    }

    /// Slot-scoped events. Caller holds the slot lock and, for events that
    /// open or close a transaction, the vehicle lock. Every status change goes
    /// through `SlotState::try_claim` / `SlotState::release`.
    fn apply_locked(&self, event: &Event, slot: &mut SlotState, vehicle: Option<&mut VehicleState>) {
        match event {
            Event::SlotClaimed { from, to, .. } => {
                slot.try_claim(*from, *to);
            }
            Event::SlotReleased { .. } => {
                slot.release();
            }
            Event::ReservationCreated { reservation } => {
                slot.try_claim(SlotStatus::Available, SlotStatus::Reserved);
                self.slots.map_reservation(reservation.id, slot.id);
                slot.insert_reservation(reservation.clone());
            }
            Event::SlotAssigned {
                reservation,
                booking,
                transaction,
            } => {
                slot.try_claim(SlotStatus::Available, SlotStatus::Reserved);
                self.slots.map_reservation(reservation.id, slot.id);
                slot.insert_reservation(reservation.clone());
                self.reservation_bookings.insert(reservation.id, booking.id);
                self.bookings.insert(booking.id, booking.clone());
                self.transactions.insert(transaction.id, transaction.clone());
                if let Some(v) = vehicle {
                    v.open_transaction = Some(transaction.id);
                }
            }
            Event::ReservationExpired { id, .. } => {
                if let Some(r) = slot.reservation_mut(id)
                    && r.status == ReservationStatus::Active
                {
                    r.status = ReservationStatus::Expired;
                }
                release_if_unheld(slot);
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(r) = slot.reservation_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                }
                release_if_unheld(slot);
            }
            Event::EntryConfirmed {
                booking_id,
                entry_time,
                ..
            } => {
                let Some(mut booking) = self.bookings.get_mut(booking_id) else {
                    return;
                };
                booking.status = BookingStatus::Active;
                if let Some(rid) = booking.reservation_id
                    && let Some(r) = slot.reservation_mut(&rid)
                {
                    r.status = ReservationStatus::Fulfilled;
                }
                if let Some(mut tx) = self.transactions.get_mut(&booking.transaction_id) {
                    tx.entry_time = *entry_time;
                }
                slot.try_claim(SlotStatus::Reserved, SlotStatus::Occupied);
            }
            Event::ExitConfirmed {
                booking_id,
                exit_time,
                cost,
                ..
            } => self.close_booking(
                booking_id,
                BookingStatus::Completed,
                ReservationStatus::Fulfilled,
                *exit_time,
                Some(*cost),
                slot,
                vehicle,
            ),
            Event::BookingCancelled { booking_id, at, .. } => self.close_booking(
                booking_id,
                BookingStatus::Cancelled,
                ReservationStatus::Cancelled,
                *at,
                None,
                slot,
                vehicle,
            ),
            Event::BookingExpired { booking_id, at, .. } => self.close_booking(
                booking_id,
                BookingStatus::Expired,
                ReservationStatus::Expired,
                *at,
                None,
                slot,
                vehicle,
            ),
            Event::SlotRestored {
                status,
                reservations,
                ..
            } => {
                slot.release();
                if *status != SlotStatus::Available {
                    slot.try_claim(SlotStatus::Available, *status);
                }
                for r in reservations {
                    self.slots.map_reservation(r.id, slot.id);
                    slot.insert_reservation(r.clone());
                }
            }
            Event::LedgerRestored {
                booking,
                transaction,
            } => {
                if let Some(rid) = booking.reservation_id {
                    self.reservation_bookings.insert(rid, booking.id);
                }
                self.bookings.insert(booking.id, booking.clone());
                self.transactions.insert(transaction.id, transaction.clone());
                if transaction.is_open()
                    && let Some(v) = vehicle
                {
                    v.open_transaction = Some(transaction.id);
                }
            }
            other => self.apply_unlocked(other),
        }
    }

    /// Terminal booking transition: the booking's active reservation takes
    /// `reservation_status`, the open transaction closes at `at`, the vehicle
    /// is free again and the slot goes back to `available`.
    #[allow(clippy::too_many_arguments)]
    fn close_booking(
        &self,
        booking_id: &Ulid,
        status: BookingStatus,
        reservation_status: ReservationStatus,
        at: Ms,
        cost: Option<Money>,
        slot: &mut SlotState,
        vehicle: Option<&mut VehicleState>,
    ) {
        let Some(mut booking) = self.bookings.get_mut(booking_id) else {
            return;
        };
        booking.status = status;
        if let Some(rid) = booking.reservation_id
            && let Some(r) = slot.reservation_mut(&rid)
            && r.status == ReservationStatus::Active
        {
            r.status = reservation_status;
        }
        if let Some(mut tx) = self.transactions.get_mut(&booking.transaction_id)
            && tx.exit_time.is_none()
        {
            tx.exit_time = Some(at);
            tx.cost = cost;
        }
        if let Some(v) = vehicle
            && v.open_transaction == Some(booking.transaction_id)
        {
            v.open_transaction = None;
        }
        release_if_unheld(slot);
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let mut facilities: Vec<Facility> =
            self.catalog.facilities.iter().map(|e| e.value().clone()).collect();
        facilities.sort_by_key(|f| f.id);
        for f in facilities {
            events.push(Event::FacilityRegistered {
                id: f.id,
                code: f.code.clone(),
                name: f.name.clone(),
                capacity: f.capacity,
            });
            if !f.open {
                events.push(Event::FacilityOpenChanged { id: f.id, open: false });
            }
            for floor in self.catalog.floors_of(&f.id) {
                let mut slots = Vec::new();
                for slot_id in self.slots.slots_on_floor(&floor.id) {
                    if let Some(arc) = self.slots.get_slot(&slot_id) {
                        slots.push((slot_id, arc.read().await.code.clone()));
                    }
                }
                events.push(Event::FloorRegistered {
                    id: floor.id,
                    facility_id: floor.facility_id,
                    number: floor.number,
                    vehicle_class: floor.vehicle_class,
                    slots,
                });
                if floor.status != FloorStatus::Active {
                    events.push(Event::FloorStatusChanged {
                        id: floor.id,
                        status: floor.status,
                    });
                }
            }
        }

        let mut tariffs: Vec<Tariff> = self.catalog.tariffs.iter().map(|e| *e.value()).collect();
        tariffs.sort_by_key(|t| (t.facility_id, t.vehicle_class));
        events.extend(tariffs.into_iter().map(|tariff| Event::TariffSet { tariff }));

        let vehicle_arcs: Vec<SharedVehicleState> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        for arc in vehicle_arcs {
            let v = arc.read().await;
            events.push(Event::VehicleRegistered {
                id: v.vehicle.id,
                plate: v.vehicle.plate.clone(),
                vehicle_class: v.vehicle.class,
            });
        }

        for slot_id in self.slots.slot_ids() {
            let Some(arc) = self.slots.get_slot(&slot_id) else {
                continue;
            };
            let slot = arc.read().await;
            if slot.status() != SlotStatus::Available || !slot.reservations.is_empty() {
                events.push(Event::SlotRestored {
                    slot_id,
                    status: slot.status(),
                    reservations: slot.reservations.clone(),
                });
            }
        }

        let bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for booking in bookings {
            if let Some(transaction) = self
                .transactions
                .get(&booking.transaction_id)
                .map(|t| t.value().clone())
            {
                events.push(Event::LedgerRestored { booking, transaction });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Back to `available` unless another active reservation still holds the slot.
fn release_if_unheld(slot: &mut SlotState) {
    if !slot.has_active_reservation() {
        slot.release();
    }
}
