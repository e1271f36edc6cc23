use serde::Serialize;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{ConflictKind, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReceipt {
    pub cost: Money,
    pub booking: Booking,
    pub transaction: Transaction,
}

/// A booking with its vehicle and slot locked, in lock order.
struct LockedBooking {
    booking: Booking,
    vehicle: OwnedRwLockWriteGuard<VehicleState>,
    slot: OwnedRwLockWriteGuard<SlotState>,
}

fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            entity: "booking",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

fn validate_instant(at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

impl Engine {
    /// Locks vehicle then slot and re-reads the booking under those locks;
    /// booking rows only change while their slot is locked.
    async fn lock_booking(&self, booking_id: Ulid) -> Result<LockedBooking, EngineError> {
        let (vehicle_id, slot_id) = self
            .bookings
            .get(&booking_id)
            .map(|b| (b.vehicle_id, b.slot_id))
            .ok_or(EngineError::NotFound(booking_id))?;
        let vehicle_arc = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let slot_arc = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let vehicle = vehicle_arc.write_owned().await;
        let slot = slot_arc.write_owned().await;
        let booking = self
            .bookings
            .get(&booking_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(LockedBooking {
            booking,
            vehicle,
            slot,
        })
    }

    fn booking_snapshot(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(booking_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// `booked → active`; the slot goes `reserved → occupied`.
    pub async fn confirm_entry(&self, booking_id: Ulid, entry_time: Ms) -> Result<Booking, EngineError> {
        validate_instant(entry_time)?;
        let _gate = self.write_gate.read().await;
        let mut locked = self.lock_booking(booking_id).await?;
        check_transition(locked.booking.status, BookingStatus::Active)?;
        if locked.slot.status() != SlotStatus::Reserved {
            return Err(EngineError::Conflict(ConflictKind::SlotUnavailable(locked.slot.id)));
        }

        let event = Event::EntryConfirmed {
            booking_id,
            slot_id: locked.slot.id,
            entry_time,
        };
        self.persist_and_apply(&event, &mut locked.slot, Some(&mut *locked.vehicle))
            .await?;
        self.booking_snapshot(&booking_id)
    }

    /// `active → completed`: closes the transaction with the tariff cost and
    /// releases the slot.
    pub async fn confirm_exit(&self, booking_id: Ulid, exit_time: Ms) -> Result<ExitReceipt, EngineError> {
        validate_instant(exit_time)?;
        let _gate = self.write_gate.read().await;
        let mut locked = self.lock_booking(booking_id).await?;
        check_transition(locked.booking.status, BookingStatus::Completed)?;
        let transaction_id = locked.booking.transaction_id;
        let entry_time = self
            .transactions
            .get(&transaction_id)
            .map(|t| t.entry_time)
            .ok_or(EngineError::NotFound(transaction_id))?;
        if exit_time < entry_time {
            return Err(EngineError::InvalidArgument("exit time before entry time"));
        }
        let (facility_id, vehicle_class) = (locked.slot.facility_id, locked.slot.vehicle_class);
        let tariff = self
            .catalog
            .tariff(facility_id, vehicle_class)
            .ok_or(EngineError::NoTariff {
                facility_id,
                vehicle_class,
            })?;
        let cost = tariff
            .cost(exit_time - entry_time)
            .ok_or(EngineError::LimitExceeded("parking cost out of range"))?;

        let event = Event::ExitConfirmed {
            booking_id,
            slot_id: locked.slot.id,
            exit_time,
            cost,
        };
        self.persist_and_apply(&event, &mut locked.slot, Some(&mut *locked.vehicle))
            .await?;
        let transaction = self
            .transactions
            .get(&transaction_id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound(transaction_id))?;
        Ok(ExitReceipt {
            cost,
            booking: self.booking_snapshot(&booking_id)?,
            transaction,
        })
    }

    /// `booked | active → cancelled`; the reservation is cancelled and the
    /// slot released in the same record.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        self.cancel_booking_inner(booking_id, now_ms()).await
    }

    /// Caller holds the write gate.
    pub(super) async fn cancel_booking_inner(&self, booking_id: Ulid, at: Ms) -> Result<Booking, EngineError> {
        let mut locked = self.lock_booking(booking_id).await?;
        check_transition(locked.booking.status, BookingStatus::Cancelled)?;
        let event = Event::BookingCancelled {
            booking_id,
            slot_id: locked.slot.id,
            at,
        };
        self.persist_and_apply(&event, &mut locked.slot, Some(&mut *locked.vehicle))
            .await?;
        info!(booking = %booking_id, slot = %locked.slot.code, "booking cancelled");
        self.booking_snapshot(&booking_id)
    }

    /// `booked → expired` once `now` is past the reservation's `expires_at`
    /// with no entry. `Ok(false)` when the booking has moved on or the hold
    /// has not lapsed.
    pub async fn expire_booking(&self, booking_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        self.expire_booking_inner(booking_id, now).await
    }

    /// Caller holds the write gate.
    pub(super) async fn expire_booking_inner(&self, booking_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let mut locked = self.lock_booking(booking_id).await?;
        if locked.booking.status != BookingStatus::Booked {
            return Ok(false);
        }
        let lapsed = match locked.booking.reservation_id {
            Some(rid) => locked.slot.reservation(&rid).is_some_and(|r| now > r.expires_at),
            None => false,
        };
        if !lapsed {
            return Ok(false);
        }
        let event = Event::BookingExpired {
            booking_id,
            slot_id: locked.slot.id,
            at: now,
        };
        self.persist_and_apply(&event, &mut locked.slot, Some(&mut *locked.vehicle))
            .await?;
        Ok(true)
    }

    /// Marks an open transaction for manual review. Never closes it: without a
    /// real exit time there is no cost.
    pub async fn flag_transaction(&self, transaction_id: Ulid, at: Ms) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let (open, flagged) = self
            .transactions
            .get(&transaction_id)
            .map(|t| (t.is_open(), t.flagged_at.is_some()))
            .ok_or(EngineError::NotFound(transaction_id))?;
        if !open || flagged {
            return Ok(false);
        }
        self.persist_unlocked(&Event::TransactionFlagged { transaction_id, at })
            .await?;
        warn!(transaction = %transaction_id, "open transaction flagged for review");
        Ok(true)
    }

    /// Open, unflagged transactions whose entry is more than `max_stay_ms` ago.
    pub fn collect_overdue_transactions(&self, now: Ms, max_stay_ms: Ms) -> Vec<Ulid> {
        let mut overdue: Vec<Ulid> = self
            .transactions
            .iter()
            .filter(|t| t.is_open() && t.flagged_at.is_none() && now - t.entry_time > max_stay_ms)
            .map(|t| t.id)
            .collect();
        overdue.sort();
        overdue
    }
}
