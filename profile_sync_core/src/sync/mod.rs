//! Cursor-based change synchronization from upstream change logs.

pub mod consolidate;
pub mod data_types;
pub mod documents;
pub mod engine;
pub mod http;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod sqlite;
pub mod traits;

pub use consolidate::consolidate;
pub use data_types::{SyncDeps, build_sync};
pub use documents::{Document, DocumentHandler, DocumentStore, MemoryDocumentStore};
pub use engine::{
    ChangeSyncEngine, DEFAULT_PAGE_SIZE, PageTransform, SyncDefinition, SyncOutcome, SyncReport,
    SyncRun,
};
pub use http::HttpChangeFeed;
pub use memory::{MemoryChangeFeed, MemoryCursorStore};
pub use models::{
    ChangeEntry, ChangeId, CursorKind, DataType, DecodedChange, FetchRequest, OperationType, Page,
    Pagination,
};
pub use postgres::PostgresSyncStore;
pub use sqlite::{SqliteCursorStore, SqliteDocumentStore};
pub use traits::{ChangeFeed, ChangeHandler, ChangePayload, CursorStore, JsonCodec, PayloadCodec};
