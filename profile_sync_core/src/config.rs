use crate::sync::models::DataType;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Where leases, cursors, and documents live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Sqlite { path: String },
    Postgres { url: String, max_connections: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSyncConfig {
    pub database: DatabaseConfig,

    pub lease_duration: Duration,
    /// Renewal ticks per lease duration.
    pub renewals_per_period: u32,

    /// How often each data type's job attempts a run.
    pub poll_interval: Duration,
    pub page_size: u32,
    pub http_timeout: Duration,

    /// Change-log endpoint per data type.
    pub upstreams: BTreeMap<DataType, String>,
    /// Data types the host schedules. Defaults to those with an upstream.
    pub enabled: Vec<DataType>,
}

impl Default for ProfileSyncConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: "data/profile_sync.db".to_string(),
            },
            lease_duration: Duration::from_secs(60),
            renewals_per_period: 3,
            poll_interval: Duration::from_secs(300),
            page_size: 500,
            http_timeout: Duration::from_secs(30),
            upstreams: BTreeMap::new(),
            enabled: Vec::new(),
        }
    }
}

impl ProfileSyncConfig {
    /// Read `PROFILE_SYNC_*` environment variables on top of the defaults.
    ///
    /// - `PROFILE_SYNC_DATABASE_URL`: `postgres://...` or `sqlite://<path>`
    /// - `PROFILE_SYNC_SQLITE_PATH`: shorthand for a SQLite file
    /// - `PROFILE_SYNC_POSTGRES_MAX_CONNECTIONS` (default 10)
    /// - `PROFILE_SYNC_LEASE_DURATION_SECS` (default 60)
    /// - `PROFILE_SYNC_RENEWALS_PER_PERIOD` (default 3)
    /// - `PROFILE_SYNC_POLL_INTERVAL_SECS` (default 300)
    /// - `PROFILE_SYNC_PAGE_SIZE` (default 500)
    /// - `PROFILE_SYNC_HTTP_TIMEOUT_SECS` (default 30)
    /// - `PROFILE_SYNC_UPSTREAM_<DATA_TYPE>`: e.g. `PROFILE_SYNC_UPSTREAM_FAVORITES`
    /// - `PROFILE_SYNC_ENABLED_DATA_TYPES`: comma-separated data type names
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        let max_connections = match get("PROFILE_SYNC_POSTGRES_MAX_CONNECTIONS") {
            Some(v) => parse_num::<u32>("PROFILE_SYNC_POSTGRES_MAX_CONNECTIONS", &v)?,
            None => 10,
        };
        if let Some(path) = get("PROFILE_SYNC_SQLITE_PATH") {
            cfg.database = DatabaseConfig::Sqlite { path };
        }
        if let Some(url) = get("PROFILE_SYNC_DATABASE_URL") {
            cfg.database = parse_database_url(&url, max_connections)?;
        }

        if let Some(v) = get("PROFILE_SYNC_LEASE_DURATION_SECS") {
            cfg.lease_duration =
                Duration::from_secs(parse_num("PROFILE_SYNC_LEASE_DURATION_SECS", &v)?);
        }
        if let Some(v) = get("PROFILE_SYNC_RENEWALS_PER_PERIOD") {
            cfg.renewals_per_period = parse_num("PROFILE_SYNC_RENEWALS_PER_PERIOD", &v)?;
        }
        if let Some(v) = get("PROFILE_SYNC_POLL_INTERVAL_SECS") {
            cfg.poll_interval = Duration::from_secs(parse_num("PROFILE_SYNC_POLL_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("PROFILE_SYNC_PAGE_SIZE") {
            cfg.page_size = parse_num("PROFILE_SYNC_PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("PROFILE_SYNC_HTTP_TIMEOUT_SECS") {
            cfg.http_timeout = Duration::from_secs(parse_num("PROFILE_SYNC_HTTP_TIMEOUT_SECS", &v)?);
        }

        for dt in DataType::ALL {
            let key = format!("PROFILE_SYNC_UPSTREAM_{}", dt.as_str().to_ascii_uppercase());
            if let Some(url) = get(&key) {
                cfg.upstreams.insert(dt, url.trim().to_string());
            }
        }

        cfg.enabled = match get("PROFILE_SYNC_ENABLED_DATA_TYPES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<DataType>>>()?,
            None => cfg.upstreams.keys().copied().collect(),
        };

        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        match &self.database {
            DatabaseConfig::Sqlite { path } if path.trim().is_empty() => {
                return Err(Error::InvalidInput("sqlite path is empty".into()));
            }
            DatabaseConfig::Postgres {
                max_connections: 0,
                ..
            } => {
                return Err(Error::InvalidInput(
                    "postgres max_connections must be > 0".into(),
                ));
            }
            _ => {}
        }
        if self.lease_duration.is_zero() {
            return Err(Error::InvalidInput("lease_duration must be > 0".into()));
        }
        if self.renewals_per_period < 2 {
            return Err(Error::InvalidInput(
                "renewals_per_period must be >= 2".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".into()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be > 0".into()));
        }
        if self.http_timeout.is_zero() {
            return Err(Error::InvalidInput("http_timeout must be > 0".into()));
        }
        for dt in &self.enabled {
            if !self.upstreams.contains_key(dt) {
                return Err(Error::InvalidInput(format!(
                    "data type {dt} is enabled but PROFILE_SYNC_UPSTREAM_{} is not set",
                    dt.as_str().to_ascii_uppercase()
                )));
            }
        }
        Ok(())
    }

    /// Time between renewal ticks of an owned lease.
    pub fn renewal_interval(&self) -> Duration {
        self.lease_duration / self.renewals_per_period.max(1)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid {key} '{raw}': {e}")))
}

fn parse_database_url(url: &str, max_connections: u32) -> Result<DatabaseConfig> {
    let url = url.trim();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(DatabaseConfig::Postgres {
            url: url.to_string(),
            max_connections,
        });
    }
    if let Some(rest) = url.strip_prefix("sqlite://") {
        let path = rest.split('?').next().unwrap_or(rest);
        return Ok(DatabaseConfig::Sqlite {
            path: path.to_string(),
        });
    }
    Err(Error::InvalidInput(format!(
        "PROFILE_SYNC_DATABASE_URL must start with postgres:// or sqlite:// (got '{url}')"
    )))
}
