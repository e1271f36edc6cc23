use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedSlotState};

/// Slots plus the indexes the allocator and the read models walk.
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlotState>,
    /// Floor → (slot code, slot id), ascending by code.
    floor_slots: DashMap<Ulid, Vec<(String, Ulid)>>,
    reservation_to_slot: DashMap<Ulid, Ulid>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            floor_slots: DashMap::new(),
            reservation_to_slot: DashMap::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert_slot(&self, slot: SlotState) {
        let mut codes = self.floor_slots.entry(slot.floor_id).or_default();
        let pos = codes
            .binary_search_by(|(code, _)| code.as_str().cmp(slot.code.as_str()))
            .unwrap_or_else(|e| e);
        codes.insert(pos, (slot.code.clone(), slot.id));
        drop(codes);
        self.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
    }

    /// Slot ids of a floor in ascending code order.
    pub fn slots_on_floor(&self, floor_id: &Ulid) -> Vec<Ulid> {
        self.floor_slots
            .get(floor_id)
            .map(|e| e.value().iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn slot_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Reservation index ────────────────────────────────────

    pub fn map_reservation(&self, reservation_id: Ulid, slot_id: Ulid) {
        self.reservation_to_slot.insert(reservation_id, slot_id);
    }

    pub fn slot_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_slot.get(reservation_id).map(|e| *e.value())
    }
}

impl Engine {
    /// Durable compare-and-swap on a slot's status. `Ok(false)` when the slot
    /// is not in `from`; nothing is written in that case.
    pub async fn claim_slot(
        &self,
        slot_id: Ulid,
        from: SlotStatus,
        to: SlotStatus,
    ) -> Result<bool, EngineError> {
        if from == to || to == SlotStatus::Available {
            return Err(EngineError::InvalidArgument(
                "claim must move a slot out of its status; use release",
            ));
        }
        let _gate = self.write_gate.read().await;
        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = slot_arc.write().await;
        if slot.status() != from {
            return Ok(false);
        }
        let event = Event::SlotClaimed { slot_id, from, to };
        self.persist_and_apply(&event, &mut slot, None).await?;
        Ok(true)
    }

    /// Durable unconditional release to `available`. Returns the previous status.
    pub async fn release_slot(&self, slot_id: Ulid) -> Result<SlotStatus, EngineError> {
        let _gate = self.write_gate.read().await;
        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = slot_arc.write().await;
        let previous = slot.status();
        if previous == SlotStatus::Available {
            return Ok(previous);
        }
        if slot.has_active_reservation() {
            warn!(slot = %slot.code, "releasing slot still held by an active reservation");
        }
        self.persist_and_apply(&Event::SlotReleased { slot_id }, &mut slot, None)
            .await?;
        Ok(previous)
    }
}
