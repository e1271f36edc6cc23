//! Newline-delimited JSON protocol. One request object per line, tagged by
//! `op`; one response object per line. Listening connections additionally
//! receive `{"event":"slot",...}` lines between responses.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{FloorStatus, Money, Ms, SlotStatus, UnknownVariant};
use crate::notify::SlotUpdate;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Select the tenant for the rest of the connection.
    Use { tenant: String },

    // ── Catalog ingestion ────────────────────────────────────
    RegisterFacility {
        id: Option<Ulid>,
        code: String,
        name: Option<String>,
        capacity: u32,
    },
    SetFacilityOpen {
        facility_id: Ulid,
        open: bool,
    },
    RegisterFloor {
        id: Option<Ulid>,
        facility_id: Ulid,
        number: u32,
        vehicle_class: String,
        slot_count: u32,
    },
    SetFloorStatus {
        floor_id: Ulid,
        status: FloorStatus,
    },
    RegisterVehicle {
        id: Option<Ulid>,
        plate: String,
        vehicle_class: String,
    },
    SetTariff {
        facility_id: Ulid,
        vehicle_class: String,
        first_hour_rate: Money,
        per_hour_rate: Money,
    },

    // ── Slot store ───────────────────────────────────────────
    ClaimSlot {
        slot_id: Ulid,
        from: SlotStatus,
        to: SlotStatus,
    },
    ReleaseSlot {
        slot_id: Ulid,
    },

    // ── Allocation and reservations ──────────────────────────
    Assign {
        facility_id: Ulid,
        vehicle_id: Ulid,
        user_id: String,
        vehicle_class: String,
        window_start: Ms,
        duration_hours: u32,
    },
    Reserve {
        slot_id: Ulid,
        vehicle_id: Ulid,
        user_id: String,
        window_start: Ms,
        window_end: Ms,
        ttl_ms: Option<Ms>,
    },
    FindConflict {
        slot_id: Ulid,
        window_start: Ms,
        window_end: Ms,
    },
    ExpireReservation {
        reservation_id: Ulid,
    },
    CancelReservation {
        reservation_id: Ulid,
    },

    // ── Booking lifecycle ────────────────────────────────────
    ConfirmEntry {
        booking_id: Ulid,
        entry_time: Option<Ms>,
    },
    ConfirmExit {
        booking_id: Ulid,
        exit_time: Option<Ms>,
    },
    Cancel {
        booking_id: Ulid,
    },

    // ── Read models ──────────────────────────────────────────
    SlotStatus {
        facility_id: Ulid,
    },
    Occupancy {
        facility_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    GetTransaction {
        transaction_id: Ulid,
    },
    OpenTransactions {
        vehicle_id: Ulid,
    },
    ReservationsForSlot {
        slot_id: Ulid,
    },
    FlaggedTransactions,

    // ── Notifications ────────────────────────────────────────
    Listen {
        facility_id: Ulid,
    },
    /// Without a facility: stop every subscription.
    Unlisten {
        facility_id: Option<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            code: None,
            message: None,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self {
            ok: false,
            data: None,
            code: Some(err.code().to_string()),
            message: Some(err.message()),
        }
    }
}

/// Pushed to listening connections.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub event: &'static str,
    #[serde(flatten)]
    pub update: &'a SlotUpdate,
}

impl<'a> Notification<'a> {
    pub fn slot(update: &'a SlotUpdate) -> Self {
        Self {
            event: "slot",
            update,
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// The line is not a valid request object.
    Malformed(String),
    LineTooLong,
    UnknownVariant(UnknownVariant),
    Tenant(String),
    TooManyChannels,
    Engine(EngineError),
    Internal(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_request",
            ProtocolError::LineTooLong => "line_too_long",
            ProtocolError::UnknownVariant(_) => "invalid_argument",
            ProtocolError::Tenant(_) => "tenant_error",
            ProtocolError::TooManyChannels => "limit_exceeded",
            ProtocolError::Engine(e) => e.code(),
            ProtocolError::Internal(_) => "internal",
        }
    }

    /// Engine errors use their user-facing wording.
    pub fn message(&self) -> String {
        match self {
            ProtocolError::Engine(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed request: {e}"),
            ProtocolError::LineTooLong => write!(f, "request line too long"),
            ProtocolError::UnknownVariant(e) => write!(f, "{e}"),
            ProtocolError::Tenant(e) => write!(f, "tenant error: {e}"),
            ProtocolError::TooManyChannels => write!(f, "too many LISTEN channels"),
            ProtocolError::Engine(e) => write!(f, "{e}"),
            ProtocolError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EngineError> for ProtocolError {
    fn from(e: EngineError) -> Self {
        ProtocolError::Engine(e)
    }
}

impl From<UnknownVariant> for ProtocolError {
    fn from(e: UnknownVariant) -> Self {
        ProtocolError::UnknownVariant(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Internal(e.to_string())
    }
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serialize a response as one protocol line (no trailing newline).
pub fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"ok":false,"code":"internal","message":"encode failed: {e}"}}"#)
    })
}
