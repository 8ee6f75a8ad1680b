use std::error::Error as StdError;

/// Common error type for `profile_sync_core`.
///
/// Storage and HTTP backends preserve the underlying error chain via
/// `Error::backend`. Upstream failures are split so a retry policy outside
/// this crate can treat server errors differently from everything else.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant the storage layer relies on did not hold. Never retried.
    #[error("unreachable state: {0}")]
    Unreachable(String),

    #[error("upstream error: {message}")]
    Upstream { message: String },

    #[error("upstream server error ({status}): {message}")]
    UpstreamServer { status: u16, message: String },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "profile_sync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap a sqlx error with the operation it came from.
    pub fn sqlx(context: &str, source: sqlx::Error) -> Self {
        Self::Backend {
            context: format!("sqlx: {context}"),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    /// SQLITE_BUSY or SQLITE_LOCKED (any extended code) from a sqlx call.
    pub fn is_sqlite_busy(&self) -> bool {
        let Self::Backend { source, .. } = self else {
            return false;
        };
        source
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|db| db.code())
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6))
    }

    /// Fatal errors stop the job loop instead of being retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Errors a later run is expected to get past on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. }
                | Self::UpstreamServer { .. }
                | Self::Backend { .. }
                | Self::BackendMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
