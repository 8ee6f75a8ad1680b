//! Storage-backed leases: at most one holder per named job across the fleet.

pub mod manager;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod provider;
pub mod sqlite;
pub mod traits;

pub use manager::{
    DEFAULT_RENEWALS_PER_PERIOD, LeaseAcquisition, LeaseManager, LeaseUnavailable, OwnedLease,
    OwnedLeaseState,
};
pub use memory::MemoryLeaseRepository;
pub use models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseRecord, LeaseReleaseResult, LeaseTicket,
};
pub use postgres::PostgresLeaseRepository;
pub use provider::StorageLeaseProvider;
pub use sqlite::SqliteLeaseRepository;
pub use traits::{LeaseProvider, LeaseRepository, SharedLeaseProvider};
