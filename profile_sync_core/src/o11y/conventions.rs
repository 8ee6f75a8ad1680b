//! Event names and span field keys shared by lease and sync telemetry.

// lease.*
pub const LEASE_ACQUIRED: &str = "lease_acquired";
pub const LEASE_CONTENDED: &str = "lease_contended";
pub const LEASE_RENEWED: &str = "lease_renewed";
pub const LEASE_LOST: &str = "lease_lost";
pub const LEASE_RELEASED: &str = "lease_released";
pub const LEASE_RELEASE_FAILED: &str = "lease_release_failed";

// sync.*
pub const SYNC_PAGE_FETCHED: &str = "page_fetched";
pub const SYNC_ENTRY_APPLIED: &str = "entry_applied";
pub const SYNC_ENTRY_SKIPPED: &str = "entry_skipped";
pub const SYNC_CURSOR_ADVANCED: &str = "cursor_advanced";
pub const SYNC_RUN_COMPLETED: &str = "run_completed";
pub const SYNC_RUN_FAILED: &str = "run_failed";
pub const SYNC_RUN_CANCELLED: &str = "run_cancelled";

// job.*
pub const JOB_SKIPPED: &str = "job_skipped";
