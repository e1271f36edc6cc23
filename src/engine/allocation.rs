use serde::Serialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ASSIGNMENTS_TOTAL, ASSIGN_CANDIDATES_SCANNED};

use super::conflict::{self, now_ms, validate_window};
use super::{ConflictKind, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub facility_id: Ulid,
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub vehicle_class: VehicleClass,
    pub window_start: Ms,
    pub duration_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub slot_id: Ulid,
    pub slot_code: String,
    pub floor_number: u32,
    pub reservation_id: Ulid,
    pub booking_id: Ulid,
    pub transaction_id: Ulid,
    pub window: Span,
    pub expires_at: Ms,
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!(ASSIGNMENTS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// First-fit allocation: floors by ascending number, slots by ascending
    /// code. The slot claim, reservation, booking and transaction are one WAL
    /// record, committed under the vehicle and slot locks.
    pub async fn assign(&self, req: AssignRequest) -> Result<SlotAssignment, EngineError> {
        if req.duration_hours == 0 {
            return Err(EngineError::InvalidArgument("duration must be at least one hour"));
        }
        if req.duration_hours > MAX_DURATION_HOURS {
            return Err(EngineError::LimitExceeded("duration too long"));
        }
        if req.user_id.is_empty() || req.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::InvalidArgument("user id must be 1..=128 bytes"));
        }
        let end = req
            .window_start
            .checked_add(Ms::from(req.duration_hours) * HOUR_MS)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let window = Span {
            start: req.window_start,
            end,
        };
        validate_window(&window)?;

        let _gate = self.write_gate.read().await;
        let vehicle_arc = self
            .get_vehicle(&req.vehicle_id)
            .ok_or(EngineError::NotFound(req.vehicle_id))?;
        let mut vehicle = vehicle_arc.write().await;
        if vehicle.vehicle.class != req.vehicle_class {
            return Err(EngineError::VehicleClassMismatch {
                registered: vehicle.vehicle.class,
                requested: req.vehicle_class,
            });
        }
        if let Some(open) = vehicle.open_transaction {
            record_outcome("open_transaction");
            return Err(EngineError::Conflict(ConflictKind::OpenTransaction(open)));
        }

        let floors = match self.eligible_floors(req.facility_id, req.vehicle_class) {
            Ok(floors) => floors,
            Err(e) => {
                record_outcome("no_eligible_floor");
                return Err(e);
            }
        };

        let mut scanned = 0u64;
        for floor in &floors {
            for slot_id in self.slots.slots_on_floor(&floor.id) {
                let Some(slot_arc) = self.get_slot(&slot_id) else {
                    continue;
                };
                let mut slot = slot_arc.write().await;
                scanned += 1;
                if slot.status() != SlotStatus::Available {
                    continue;
                }
                let now = now_ms();
                if let Some(existing) = conflict::find_conflict(&slot, &window, now) {
                    debug!(slot = %slot.code, reservation = %existing.id, "assign: window overlaps, next candidate");
                    continue;
                }

                let reservation = Reservation {
                    id: Ulid::new(),
                    slot_id,
                    vehicle_id: req.vehicle_id,
                    user_id: req.user_id.clone(),
                    span: window,
                    status: ReservationStatus::Active,
                    expires_at: window.start + self.reservation_grace_ms,
                    created_at: now,
                };
                let transaction = Transaction {
                    id: Ulid::new(),
                    vehicle_id: req.vehicle_id,
                    user_id: req.user_id.clone(),
                    slot_id,
                    entry_time: window.start,
                    exit_time: None,
                    cost: None,
                    flagged_at: None,
                };
                // pending → booked happens inside this record: a booking is
                // never observable as pending.
                let booking = Booking {
                    id: Ulid::new(),
                    transaction_id: transaction.id,
                    reservation_id: Some(reservation.id),
                    vehicle_id: req.vehicle_id,
                    slot_id,
                    status: BookingStatus::Booked,
                    created_at: now,
                };
                let assignment = SlotAssignment {
                    slot_id,
                    slot_code: slot.code.clone(),
                    floor_number: floor.number,
                    reservation_id: reservation.id,
                    booking_id: booking.id,
                    transaction_id: transaction.id,
                    window,
                    expires_at: reservation.expires_at,
                };

                let event = Event::SlotAssigned {
                    reservation,
                    booking,
                    transaction,
                };
                self.persist_and_apply(&event, &mut slot, Some(&mut *vehicle))
                    .await?;
                metrics::histogram!(ASSIGN_CANDIDATES_SCANNED).record(scanned as f64);
                record_outcome("assigned");
                info!(slot = %assignment.slot_code, booking = %assignment.booking_id, "slot assigned");
                return Ok(assignment);
            }
        }

        metrics::histogram!(ASSIGN_CANDIDATES_SCANNED).record(scanned as f64);
        record_outcome("no_available_slot");
        Err(EngineError::NoAvailableSlot {
            facility_id: req.facility_id,
            vehicle_class: req.vehicle_class,
        })
    }
}
