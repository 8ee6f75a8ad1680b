//! Profile sync core: storage-backed leases and cursor-based change
//! synchronization shared by every profile data host.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod o11y;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatabaseConfig, ProfileSyncConfig};
pub use error::{Error, Result};
pub use jobs::{JobOutcome, LeasedSyncJob, SyncScheduler};
pub use lease::{
    LeaseAcquisition, LeaseManager, LeaseProvider, LeaseRepository, OwnedLease,
    StorageLeaseProvider,
};
pub use sync::{
    ChangeFeed, ChangeId, CursorStore, DataType, DocumentStore, SyncDeps, SyncReport, SyncRun,
    build_sync,
};
