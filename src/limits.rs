//! Hard bounds on what a single tenant can hold. Every public mutation checks
//! the relevant limit before touching state.

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_SECTIONS_PER_TENANT: usize = 50_000;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_MEETINGS_PER_SECTION: usize = 32;
pub const MAX_WAITLIST_LEN: usize = 5_000;
/// Enrolled plus Waitlisted records. Dropped and Rejected history is not counted.
pub const MAX_LIVE_RECORDS_PER_SECTION: usize = MAX_CAPACITY as usize + MAX_WAITLIST_LEN;

/// Course, term and other human-readable codes.
pub const MAX_CODE_LEN: usize = 32;
pub const MAX_HOLD_REASON_LEN: usize = 512;
pub const MAX_HOLDS_PER_STUDENT: usize = 64;
pub const MAX_COMPLETED_COURSES_PER_STUDENT: usize = 512;

/// Nesting depth of AND/OR groups in a prerequisite expression.
pub const MAX_PREREQUISITE_DEPTH: usize = 8;
pub const MAX_PREREQUISITE_LEN: usize = 2_048;

/// Rows in a single multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 1_000;
