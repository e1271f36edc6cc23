use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{self, now_ms, validate_window};
use super::{ConflictKind, Engine, EngineError};

impl Engine {
    /// Live reservation on `slot_id` overlapping `[start, end)`, if any.
    pub async fn find_conflict(
        &self,
        slot_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Option<Reservation>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidArgument("window end must be after start"));
        }
        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let slot = slot_arc.read().await;
        Ok(conflict::find_conflict(&slot, &Span::new(start, end), now_ms()).cloned())
    }

    /// Standalone hold: claims the slot `available → reserved` and records the
    /// reservation in one WAL record.
    pub async fn create_reservation(
        &self,
        slot_id: Ulid,
        vehicle_id: Ulid,
        user_id: &str,
        window: Span,
        ttl_ms: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_window(&window)?;
        if !(0..=MAX_RESERVATION_TTL_MS).contains(&ttl_ms) {
            return Err(EngineError::LimitExceeded("reservation ttl out of range"));
        }
        if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::InvalidArgument("user id must be 1..=128 bytes"));
        }

        let _gate = self.write_gate.read().await;
        let vehicle_arc = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let vehicle = vehicle_arc.read().await;
        let mut slot = slot_arc.write().await;

        if vehicle.vehicle.class != slot.vehicle_class {
            return Err(EngineError::VehicleClassMismatch {
                registered: vehicle.vehicle.class,
                requested: slot.vehicle_class,
            });
        }
        let now = now_ms();
        if let Some(existing) = conflict::find_conflict(&slot, &window, now) {
            return Err(EngineError::Conflict(ConflictKind::Overlap(existing.id)));
        }
        if slot.status() != SlotStatus::Available {
            return Err(EngineError::Conflict(ConflictKind::SlotUnavailable(slot_id)));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            slot_id,
            vehicle_id,
            user_id: user_id.to_string(),
            span: window,
            status: ReservationStatus::Active,
            expires_at: window.start + ttl_ms,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&event, &mut slot, None).await?;
        Ok(reservation)
    }

    pub async fn expire_reservation(&self, id: Ulid) -> Result<bool, EngineError> {
        self.expire_reservation_at(id, now_ms()).await
    }

    /// Idempotent. `Ok(false)` when nothing changed.
    ///
    /// A standalone reservation expires whenever it is still active. One owned
    /// by a booking expires only once `now` is past `expires_at` and the
    /// vehicle never entered; the booking expires with it.
    pub async fn expire_reservation_at(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let slot_id = self
            .slots
            .slot_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        if let Some(booking_id) = self.reservation_bookings.get(&id).map(|e| *e.value()) {
            return self.expire_booking_inner(booking_id, now).await;
        }

        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = slot_arc.write().await;
        let Some(reservation) = slot.reservation(&id) else {
            return Err(EngineError::NotFound(id));
        };
        if reservation.status != ReservationStatus::Active {
            debug!(reservation = %id, status = reservation.status.as_str(), "expire: already settled");
            return Ok(false);
        }
        let event = Event::ReservationExpired { id, slot_id };
        self.persist_and_apply(&event, &mut slot, None).await?;
        Ok(true)
    }

    /// Cancels the reservation and releases its slot. A reservation owned by a
    /// booking cancels the whole booking.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate.read().await;
        let slot_id = self
            .slots
            .slot_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        if let Some(booking_id) = self.reservation_bookings.get(&id).map(|e| *e.value()) {
            self.cancel_booking_inner(booking_id, now_ms()).await?;
        } else {
            let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
            let mut slot = slot_arc.write().await;
            let status = slot
                .reservation(&id)
                .map(|r| r.status)
                .ok_or(EngineError::NotFound(id))?;
            if status != ReservationStatus::Active {
                return Err(EngineError::InvalidTransition {
                    entity: "reservation",
                    from: status.as_str(),
                    to: ReservationStatus::Cancelled.as_str(),
                });
            }
            let event = Event::ReservationCancelled { id, slot_id };
            self.persist_and_apply(&event, &mut slot, None).await?;
        }

        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let slot = slot_arc.read().await;
        slot.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Active reservations whose `expires_at` is before `now`. Slots locked by
    /// a writer right now are skipped; the next sweep picks them up.
    pub fn collect_lapsed_reservations(&self, now: Ms) -> Vec<Ulid> {
        let mut lapsed = Vec::new();
        for slot_id in self.slots.slot_ids() {
            let Some(slot_arc) = self.get_slot(&slot_id) else {
                continue;
            };
            let Ok(slot) = slot_arc.try_read() else {
                continue;
            };
            lapsed.extend(
                slot.reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Active && r.expires_at < now)
                    .map(|r| r.id),
            );
        }
        lapsed
    }
}
