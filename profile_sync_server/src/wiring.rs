//! Builds the collaborators for a host process from [`ProfileSyncConfig`].

use profile_sync_core::config::{DatabaseConfig, ProfileSyncConfig};
use profile_sync_core::db;
use profile_sync_core::jobs::{LeasedSyncJob, SyncScheduler};
use profile_sync_core::lease::{
    LeaseManager, LeaseRepository, PostgresLeaseRepository, SqliteLeaseRepository,
    StorageLeaseProvider,
};
use profile_sync_core::o11y::{SharedMetrics, TracingMetrics};
use profile_sync_core::sync::{
    CursorStore, DataType, DocumentStore, HttpChangeFeed, PostgresSyncStore, SqliteCursorStore,
    SqliteDocumentStore, SyncDeps, build_sync,
};
use profile_sync_core::{Error, Result};
use std::sync::Arc;

/// Storage shared by all jobs of one process.
#[derive(Clone)]
pub struct Stores {
    pub leases: Arc<dyn LeaseRepository>,
    pub cursors: Arc<dyn CursorStore>,
    pub documents: Arc<dyn DocumentStore>,
}

/// Open the configured database and apply its schema.
#[tracing::instrument(level = "info", skip_all)]
pub async fn build_stores(cfg: &ProfileSyncConfig) -> Result<Stores> {
    match &cfg.database {
        DatabaseConfig::Sqlite { path } => {
            let pool = db::open_sqlite(path).await?;
            let leases = SqliteLeaseRepository::new(pool.clone()).await?;
            let cursors = SqliteCursorStore::new(pool.clone()).await?;
            let documents = SqliteDocumentStore::new(pool).await?;
            tracing::info!(path = %path, "using sqlite storage");
            Ok(Stores {
                leases: Arc::new(leases),
                cursors: Arc::new(cursors),
                documents: Arc::new(documents),
            })
        }
        DatabaseConfig::Postgres {
            url,
            max_connections,
        } => {
            let pool = db::connect_postgres(url, *max_connections).await?;
            let leases = PostgresLeaseRepository::from_pool(pool.clone());
            leases.migrate().await?;
            let sync_store = PostgresSyncStore::new(pool);
            sync_store.migrate().await?;
            tracing::info!("using postgres storage");
            let sync_store = Arc::new(sync_store);
            Ok(Stores {
                leases: Arc::new(leases),
                cursors: sync_store.clone(),
                documents: sync_store,
            })
        }
    }
}

pub fn build_feed(cfg: &ProfileSyncConfig) -> Result<HttpChangeFeed> {
    let mut feed = HttpChangeFeed::new(cfg.http_timeout)?;
    for (data_type, url) in &cfg.upstreams {
        feed = feed.with_endpoint(*data_type, url.clone());
    }
    Ok(feed)
}

/// Everything needed to run jobs, built once per process.
pub struct Runtime {
    pub config: ProfileSyncConfig,
    pub stores: Stores,
    pub leases: LeaseManager,
    pub deps: SyncDeps,
    pub metrics: SharedMetrics,
}

impl Runtime {
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn build(config: ProfileSyncConfig) -> Result<Self> {
        config.validate()?;
        let metrics: SharedMetrics = Arc::new(TracingMetrics);
        let stores = build_stores(&config).await?;
        let feed = build_feed(&config)?;

        let provider = Arc::new(StorageLeaseProvider::new(stores.leases.clone()));
        let leases = LeaseManager::new(provider, metrics.clone())
            .with_renewals_per_period(config.renewals_per_period)?;
        let deps = SyncDeps {
            feed: Arc::new(feed),
            cursors: stores.cursors.clone(),
            documents: stores.documents.clone(),
            metrics: metrics.clone(),
            page_size: config.page_size,
        };
        Ok(Self {
            config,
            stores,
            leases,
            deps,
            metrics,
        })
    }

    pub fn job(&self, data_type: DataType) -> Result<LeasedSyncJob> {
        if !self.config.upstreams.contains_key(&data_type) {
            return Err(Error::InvalidInput(format!(
                "no upstream configured for {data_type}"
            )));
        }
        Ok(LeasedSyncJob::new(
            build_sync(data_type, &self.deps),
            self.leases.clone(),
            self.config.lease_duration,
            self.metrics.clone(),
        ))
    }

    pub fn scheduler(&self) -> Result<SyncScheduler> {
        let mut scheduler = SyncScheduler::new(self.config.poll_interval);
        for data_type in &self.config.enabled {
            scheduler = scheduler.with_job(self.job(*data_type)?);
        }
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_sync_core::jobs::JobOutcome;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn config(vars: &[(&str, String)]) -> ProfileSyncConfig {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        ProfileSyncConfig::from_lookup(|k| map.get(k).cloned()).unwrap()
    }

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("profile-sync-wiring-{}", uuid::Uuid::new_v4()))
            .join("sync.db")
    }

    #[tokio::test]
    async fn scheduler_gets_one_job_per_enabled_type() {
        let db = temp_db();
        let rt = Runtime::build(config(&[
            ("PROFILE_SYNC_SQLITE_PATH", db.display().to_string()),
            ("PROFILE_SYNC_UPSTREAM_FAVORITES", "http://127.0.0.1:9/f".into()),
            ("PROFILE_SYNC_UPSTREAM_PORTAL_SETTINGS", "http://127.0.0.1:9/p".into()),
        ]))
        .await
        .unwrap();
        let scheduler = rt.scheduler().unwrap();
        let types: Vec<_> = scheduler.jobs().iter().map(|j| j.data_type()).collect();
        assert_eq!(types, vec![DataType::Favorites, DataType::PortalSettings]);
        assert!(rt.job(DataType::OfficialAddresses).is_err());
    }

    #[tokio::test]
    async fn sync_once_against_a_mock_upstream() {
        let mut server = mockito::Server::new_async().await;
        let _page = server
            .mock("GET", "/favorites/changes")
            .match_query(mockito::Matcher::UrlEncoded(
                "since".into(),
                "0001-01-01T00:00:00Z".into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"entries":[{"operation":"Insert","changeId":"2024-05-01T10:00:00Z","payload":{"personIdentifier":"p1","resourceId":"r1"}}]}"#,
            )
            .create_async()
            .await;
        let _empty = server
            .mock("GET", "/favorites/changes")
            .match_query(mockito::Matcher::UrlEncoded(
                "since".into(),
                "2024-05-01T10:00:00Z".into(),
            ))
            .with_status(200)
            .with_body(r#"{"entries":[]}"#)
            .create_async()
            .await;

        let db = temp_db();
        let rt = Runtime::build(config(&[
            ("PROFILE_SYNC_SQLITE_PATH", db.display().to_string()),
            (
                "PROFILE_SYNC_UPSTREAM_FAVORITES",
                format!("{}/favorites/changes", server.url()),
            ),
        ]))
        .await
        .unwrap();

        let outcome = rt
            .job(DataType::Favorites)
            .unwrap()
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        let JobOutcome::Ran { report, lease_lost } = outcome else {
            panic!("expected a run");
        };
        assert!(!lease_lost);
        assert_eq!(report.applied, 1);
        assert!(
            rt.stores
                .documents
                .get(DataType::Favorites, "p1:r1")
                .await
                .unwrap()
                .is_some()
        );
        if let Some(dir) = db.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
