use clap::{Parser, Subcommand};
use profile_sync_core::sync::DataType;

#[derive(Debug, Parser)]
#[command(
    name = "profile-sync",
    version,
    about = "Leased change-log synchronization for profile data"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every enabled sync job until interrupted (default if no subcommand given).
    Serve,

    /// Create lease, cursor, and document tables in the configured database.
    Migrate,

    /// Run a single leased sync for one data type and print the outcome as JSON.
    SyncOnce {
        /// e.g. `favorites`, `person-contact-preferences`.
        #[arg(long, env = "PROFILE_SYNC_DATA_TYPE")]
        data_type: DataType,
    },

    /// Print the effective configuration as JSON.
    ShowConfig,
}
