use crate::model::{Money, Ms, HOUR_MS};

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_FACILITIES_PER_TENANT: usize = 10_000;
pub const MAX_FLOORS_PER_FACILITY: usize = 200;
pub const MAX_SLOTS_PER_FLOOR: u32 = 5_000;
pub const MAX_VEHICLES_PER_TENANT: usize = 1_000_000;
pub const MAX_CODE_LEN: usize = 16;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_USER_ID_LEN: usize = 128;
/// Upper bound for either tariff rate, in minor currency units.
pub const MAX_RATE: Money = 1_000_000_000_000;

// ── Allocation ───────────────────────────────────────────────────

pub const MAX_DURATION_HOURS: u32 = 24 * 7;
pub const MAX_RESERVATION_TTL_MS: Ms = 24 * HOUR_MS;
pub const DEFAULT_RESERVATION_GRACE_MS: Ms = 15 * 60_000;
/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

// ── Server ───────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_LISTEN_CHANNELS: usize = 64;
