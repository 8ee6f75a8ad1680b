pub mod conventions;
pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, SharedMetrics, TracingMetrics};

use crate::{Error, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global JSON subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Set
/// `PROFILE_SYNC_LOG_FORMAT=pretty` for human-readable local output.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_global_from_env() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let pretty = std::env::var("PROFILE_SYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("pretty"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if pretty {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}
