use crate::model::{DAY_MS, Ms};

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_IDENTITY_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_ERROR_LEN: usize = 1024;

pub const MAX_WINDOWS_PER_FACILITY: usize = 512;
pub const MAX_CLOSURES_PER_FACILITY: usize = 10_000;
pub const MAX_BOOKINGS_PER_FACILITY: usize = 100_000;
pub const MAX_OCCURRENCES_PER_PROGRAM: usize = 10_000;
pub const MAX_RESERVATIONS_PER_LEDGER: usize = 100_000;
pub const MAX_CAPACITY: u32 = 1_000_000;

/// Widest range a slot listing may scan.
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * DAY_MS;
pub const MAX_SLOTS_PER_QUERY: usize = 10_000;
pub const MAX_OUTBOX_BATCH: usize = 1_000;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Longest advance-booking horizon or cancellation cutoff.
pub const MAX_POLICY_LEAD_MS: Ms = 10 * 366 * DAY_MS;
/// ±18h, the widest offset chrono accepts.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;
