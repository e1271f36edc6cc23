use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Amount in the tariff's minor currency unit.
pub type Money = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Closed enumerations ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Shared by the vehicle registry, floors and slots. Strings are only
/// accepted at ingestion, through `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleClass {
    TwoWheel,
    FourWheel,
    Oversize,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 3] = [Self::TwoWheel, Self::FourWheel, Self::Oversize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoWheel => "two-wheel",
            Self::FourWheel => "four-wheel",
            Self::Oversize => "oversize",
        }
    }
}

impl FromStr for VehicleClass {
    type Err = UnknownVariant;

    /// Accepts the canonical names plus the legacy labels found in older
    /// registries ("Roda Dua", "Motor", "Mobil", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c == ' ' { '-' } else { c })
            .collect();
        match normalized.as_str() {
            "two-wheel" | "2w" | "motor" | "motorcycle" | "roda-dua" => Ok(Self::TwoWheel),
            "four-wheel" | "4w" | "car" | "mobil" | "roda-empat" => Ok(Self::FourWheel),
            "oversize" | "bus" | "truck" | "truk" => Ok(Self::Oversize),
            _ => Err(UnknownVariant {
                kind: "vehicle class",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorStatus {
    Active,
    Maintenance,
    Inactive,
}

impl FloorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for FloorStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "maintenance" => Ok(Self::Maintenance),
            "inactive" => Ok(Self::Inactive),
            _ => Err(UnknownVariant {
                kind: "floor status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Reserved,
    Occupied,
    Maintenance,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Occupied => "occupied",
            Self::Maintenance => "maintenance",
        }
    }
}

impl FromStr for SlotStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "occupied" => Ok(Self::Occupied),
            "maintenance" => Ok(Self::Maintenance),
            _ => Err(UnknownVariant {
                kind: "slot status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    /// The vehicle entered; the hold became a parking episode.
    Fulfilled,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Fulfilled => "fulfilled",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Booked,
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Booked => "booked",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Booked)
                | (Pending, Cancelled)
                | (Booked, Active)
                | (Booked, Cancelled)
                | (Booked, Expired)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }
}

// ── Catalog records ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub code: String,
    pub name: Option<String>,
    pub capacity: u32,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floor {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub number: u32,
    pub vehicle_class: VehicleClass,
    pub status: FloorStatus,
    pub slot_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub plate: String,
    pub class: VehicleClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    pub facility_id: Ulid,
    pub vehicle_class: VehicleClass,
    pub first_hour_rate: Money,
    pub per_hour_rate: Money,
}

impl Tariff {
    /// First hour flat (inclusive of exactly one hour), then every started
    /// hour at `per_hour_rate`. `None` if the amount does not fit in `Money`.
    pub fn cost(&self, stay_ms: Ms) -> Option<Money> {
        if stay_ms <= HOUR_MS {
            return Some(self.first_hour_rate);
        }
        let extra = stay_ms - HOUR_MS;
        let extra_hours = extra / HOUR_MS + Ms::from(extra % HOUR_MS != 0);
        extra_hours
            .checked_mul(self.per_hour_rate)?
            .checked_add(self.first_hour_rate)
    }
}

// ── Allocation records ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub expires_at: Ms,
    pub created_at: Ms,
}

impl Reservation {
    /// Active and not yet past `expires_at`.
    pub fn is_live(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Active && now <= self.expires_at
    }

    /// Status as observed at `now`: an active hold past its expiry reads as
    /// expired before the sweeper has written it.
    pub fn effective_status(&self, now: Ms) -> ReservationStatus {
        if self.status == ReservationStatus::Active && now > self.expires_at {
            ReservationStatus::Expired
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub slot_id: Ulid,
    pub entry_time: Ms,
    pub exit_time: Option<Ms>,
    pub cost: Option<Money>,
    /// Set by the sweeper when the stay exceeds the configured maximum.
    pub flagged_at: Option<Ms>,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub transaction_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub vehicle_id: Ulid,
    pub slot_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
}

// ── Lockable state ───────────────────────────────────────────────

/// One slot and every reservation ever placed on it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub floor_id: Ulid,
    pub facility_id: Ulid,
    pub code: String,
    pub vehicle_class: VehicleClass,
    status: SlotStatus,
    pub reservations: Vec<Reservation>,
}

impl SlotState {
    pub fn new(id: Ulid, floor_id: Ulid, facility_id: Ulid, code: String, vehicle_class: VehicleClass) -> Self {
        Self {
            id,
            floor_id,
            facility_id,
            code,
            vehicle_class,
            status: SlotStatus::Available,
            reservations: Vec::new(),
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Compare-and-swap on status. The only way a slot leaves a status other
    /// than through `release`.
    pub fn try_claim(&mut self, from: SlotStatus, to: SlotStatus) -> bool {
        if self.status != from {
            return false;
        }
        self.status = to;
        true
    }

    /// Unconditionally back to `available`; returns the previous status.
    pub fn release(&mut self) -> SlotStatus {
        std::mem::replace(&mut self.status, SlotStatus::Available)
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn has_active_reservation(&self) -> bool {
        self.reservations
            .iter()
            .any(|r| r.status == ReservationStatus::Active)
    }
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// The single transaction with no exit time, if any.
    pub open_transaction: Option<Ulid>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            open_transaction: None,
        }
    }
}

/// The event types. This is the WAL record format; one record is one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityRegistered {
        id: Ulid,
        code: String,
        name: Option<String>,
        capacity: u32,
    },
    FacilityOpenChanged {
        id: Ulid,
        open: bool,
    },
    FloorRegistered {
        id: Ulid,
        facility_id: Ulid,
        number: u32,
        vehicle_class: VehicleClass,
        /// (slot id, slot code) in ascending code order.
        slots: Vec<(Ulid, String)>,
    },
    FloorStatusChanged {
        id: Ulid,
        status: FloorStatus,
    },
    VehicleRegistered {
        id: Ulid,
        plate: String,
        vehicle_class: VehicleClass,
    },
    TariffSet {
        tariff: Tariff,
    },
    SlotClaimed {
        slot_id: Ulid,
        from: SlotStatus,
        to: SlotStatus,
    },
    SlotReleased {
        slot_id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Slot claim + reservation + booking + transaction.
    SlotAssigned {
        reservation: Reservation,
        booking: Booking,
        transaction: Transaction,
    },
    ReservationExpired {
        id: Ulid,
        slot_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        slot_id: Ulid,
    },
    EntryConfirmed {
        booking_id: Ulid,
        slot_id: Ulid,
        entry_time: Ms,
    },
    ExitConfirmed {
        booking_id: Ulid,
        slot_id: Ulid,
        exit_time: Ms,
        cost: Money,
    },
    BookingCancelled {
        booking_id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    BookingExpired {
        booking_id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    TransactionFlagged {
        transaction_id: Ulid,
        at: Ms,
    },
    // Compaction-only records.
    SlotRestored {
        slot_id: Ulid,
        status: SlotStatus,
        reservations: Vec<Reservation>,
    },
    LedgerRestored {
        booking: Booking,
        transaction: Transaction,
    },
}

impl Event {
    /// Slot whose lock must be held while applying this event.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotClaimed { slot_id, .. }
            | Event::SlotReleased { slot_id }
            | Event::ReservationExpired { slot_id, .. }
            | Event::ReservationCancelled { slot_id, .. }
            | Event::EntryConfirmed { slot_id, .. }
            | Event::ExitConfirmed { slot_id, .. }
            | Event::BookingCancelled { slot_id, .. }
            | Event::BookingExpired { slot_id, .. }
            | Event::SlotRestored { slot_id, .. } => Some(*slot_id),
            Event::ReservationCreated { reservation } | Event::SlotAssigned { reservation, .. } => {
                Some(reservation.slot_id)
            }
            Event::LedgerRestored { booking, .. } => Some(booking.slot_id),
            Event::FacilityRegistered { .. }
            | Event::FacilityOpenChanged { .. }
            | Event::FloorRegistered { .. }
            | Event::FloorStatusChanged { .. }
            | Event::VehicleRegistered { .. }
            | Event::TariffSet { .. }
            | Event::TransactionFlagged { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatusRow {
    pub floor_id: Ulid,
    pub floor_number: u32,
    pub slot_id: Ulid,
    pub slot_code: String,
    pub vehicle_class: VehicleClass,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub available: u32,
    pub reserved: u32,
    pub occupied: u32,
    pub maintenance: u32,
}

impl Occupancy {
    pub fn total(&self) -> u32 {
        self.available + self.reserved + self.occupied + self.maintenance
    }
}
