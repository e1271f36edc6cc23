use ulid::Ulid;

use crate::model::VehicleClass;

/// What a `Conflict` collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// The vehicle already has a transaction with no exit time.
    OpenTransaction(Ulid),
    /// An active reservation on the slot overlaps the requested window.
    Overlap(Ulid),
    /// The slot is not in the status the operation requires.
    SlotUnavailable(Ulid),
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NoEligibleFloor {
        facility_id: Ulid,
        vehicle_class: VehicleClass,
    },
    NoAvailableSlot {
        facility_id: Ulid,
        vehicle_class: VehicleClass,
    },
    Conflict(ConflictKind),
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    VehicleClassMismatch {
        registered: VehicleClass,
        requested: VehicleClass,
    },
    NoTariff {
        facility_id: Ulid,
        vehicle_class: VehicleClass,
    },
    InvalidArgument(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NoEligibleFloor { .. } => "no_eligible_floor",
            EngineError::NoAvailableSlot { .. } => "no_available_slot",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::VehicleClassMismatch { .. } => "vehicle_class_mismatch",
            EngineError::NoTariff { .. } => "no_tariff",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    /// Wording shown to end users. Never exposes candidate iteration or ids.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::NoEligibleFloor { .. } | EngineError::NoAvailableSlot { .. } => {
                "no slot currently available for this vehicle type".into()
            }
            EngineError::Conflict(ConflictKind::OpenTransaction(_)) => {
                "you already have an active parking session".into()
            }
            EngineError::Conflict(_) => "the selected slot is no longer available".into(),
            EngineError::WalError(_) => "internal storage error".into(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoEligibleFloor {
                facility_id,
                vehicle_class,
            } => write!(
                f,
                "no active {vehicle_class} floor in facility {facility_id}"
            ),
            EngineError::NoAvailableSlot {
                facility_id,
                vehicle_class,
            } => write!(
                f,
                "no {vehicle_class} slot available in facility {facility_id}"
            ),
            EngineError::Conflict(ConflictKind::OpenTransaction(id)) => {
                write!(f, "vehicle already has open transaction: {id}")
            }
            EngineError::Conflict(ConflictKind::Overlap(id)) => {
                write!(f, "conflict with reservation: {id}")
            }
            EngineError::Conflict(ConflictKind::SlotUnavailable(id)) => {
                write!(f, "slot not in required status: {id}")
            }
            EngineError::InvalidTransition { entity, from, to } => {
                write!(f, "invalid {entity} transition: {from} -> {to}")
            }
            EngineError::VehicleClassMismatch {
                registered,
                requested,
            } => write!(
                f,
                "vehicle is registered as {registered}, requested {requested}"
            ),
            EngineError::NoTariff {
                facility_id,
                vehicle_class,
            } => write!(f, "no {vehicle_class} tariff for facility {facility_id}"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
