use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{SlotState, SlotStatus};

const CHANNEL_CAPACITY: usize = 256;

/// One slot status change, as pushed to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotUpdate {
    pub facility_id: Ulid,
    pub slot_id: Ulid,
    pub slot_code: String,
    pub status: SlotStatus,
}

impl SlotUpdate {
    pub fn of(slot: &SlotState) -> Self {
        Self {
            facility_id: slot.facility_id,
            slot_id: slot.id,
            slot_code: slot.code.clone(),
            status: slot.status(),
        }
    }
}

/// Broadcast hub for slot status changes, one channel per facility.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<SlotUpdate>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a facility's changes. Creates the channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<SlotUpdate> {
        let sender = self
            .channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, update: SlotUpdate) {
        if let Some(sender) = self.channels.get(&update.facility_id) {
            let _ = sender.send(update);
        }
    }

    /// Drop a facility's channel once its last listener is gone.
    pub fn prune(&self, facility_id: &Ulid) {
        self.channels
            .remove_if(facility_id, |_, sender| sender.receiver_count() == 0);
    }
}
