use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Every slot of a facility, floor number then slot code ascending.
    pub async fn slot_status(&self, facility_id: Ulid) -> Result<Vec<SlotStatusRow>, EngineError> {
        if self.catalog.facility(&facility_id).is_none() {
            return Err(EngineError::NotFound(facility_id));
        }
        let mut rows = Vec::new();
        for floor in self.catalog.floors_of(&facility_id) {
            for slot_id in self.slots.slots_on_floor(&floor.id) {
                let Some(slot_arc) = self.get_slot(&slot_id) else {
                    continue;
                };
                let slot = slot_arc.read().await;
                rows.push(SlotStatusRow {
                    floor_id: floor.id,
                    floor_number: floor.number,
                    slot_id,
                    slot_code: slot.code.clone(),
                    vehicle_class: slot.vehicle_class,
                    status: slot.status(),
                });
            }
        }
        Ok(rows)
    }

    pub async fn occupancy(&self, facility_id: Ulid) -> Result<Occupancy, EngineError> {
        let mut occupancy = Occupancy::default();
        for row in self.slot_status(facility_id).await? {
            match row.status {
                SlotStatus::Available => occupancy.available += 1,
                SlotStatus::Reserved => occupancy.reserved += 1,
                SlotStatus::Occupied => occupancy.occupied += 1,
                SlotStatus::Maintenance => occupancy.maintenance += 1,
            }
        }
        Ok(occupancy)
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    pub fn get_transaction(&self, id: &Ulid) -> Option<Transaction> {
        self.transactions.get(id).map(|t| t.value().clone())
    }

    /// Reservation as observed now: an unswept lapsed hold reads `expired`.
    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let slot_id = self.slots.slot_for_reservation(id)?;
        let slot_arc = self.get_slot(&slot_id)?;
        let slot = slot_arc.read().await;
        let now = now_ms();
        slot.reservation(id).map(|r| Reservation {
            status: r.effective_status(now),
            ..r.clone()
        })
    }

    /// Zero or one row per vehicle.
    pub fn open_transactions(&self, vehicle_id: &Ulid) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.vehicle_id == *vehicle_id && t.is_open())
            .map(|t| t.value().clone())
            .collect()
    }

    pub async fn reservations_for_slot(&self, slot_id: &Ulid) -> Result<Vec<Reservation>, EngineError> {
        let slot_arc = self.get_slot(slot_id).ok_or(EngineError::NotFound(*slot_id))?;
        let slot = slot_arc.read().await;
        let now = now_ms();
        Ok(slot
            .reservations
            .iter()
            .map(|r| Reservation {
                status: r.effective_status(now),
                ..r.clone()
            })
            .collect())
    }

    /// Booking that owns a reservation made by `assign`.
    pub fn booking_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_bookings.get(reservation_id).map(|e| *e.value())
    }

    pub fn flagged_transactions(&self) -> Vec<Transaction> {
        let mut flagged: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.flagged_at.is_some())
            .map(|t| t.value().clone())
            .collect();
        flagged.sort_by_key(|t| t.id);
        flagged
    }
}
