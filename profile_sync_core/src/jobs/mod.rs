//! Leased sync jobs and the loops that drive them.

pub mod leased;
pub mod scheduler;

pub use leased::{JobOutcome, LeasedSyncJob};
pub use scheduler::SyncScheduler;
