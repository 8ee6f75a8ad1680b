use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream change logs synchronized into the profile store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Favorites,
    ProfessionalNotificationSettings,
    PortalSettings,
    PersonContactPreferences,
    OrganizationNotificationAddresses,
    OfficialAddresses,
}

/// How a data type's change identifiers are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Sequence,
    Timestamp,
}

/// How the upstream hands out subsequent pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    /// Re-query with the advanced cursor.
    CursorRequery,
    /// Follow the page's `next` link until none is returned.
    NextLink,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Favorites,
        DataType::ProfessionalNotificationSettings,
        DataType::PortalSettings,
        DataType::PersonContactPreferences,
        DataType::OrganizationNotificationAddresses,
        DataType::OfficialAddresses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Favorites => "favorites",
            DataType::ProfessionalNotificationSettings => "professional_notification_settings",
            DataType::PortalSettings => "portal_settings",
            DataType::PersonContactPreferences => "person_contact_preferences",
            DataType::OrganizationNotificationAddresses => "organization_notification_addresses",
            DataType::OfficialAddresses => "official_addresses",
        }
    }

    /// Name of the lease that guards this data type's job.
    pub fn lease_id(&self) -> String {
        format!("profile-sync:{}", self.as_str())
    }

    pub fn cursor_kind(&self) -> CursorKind {
        match self {
            DataType::PersonContactPreferences => CursorKind::Sequence,
            _ => CursorKind::Timestamp,
        }
    }

    pub fn pagination(&self) -> Pagination {
        match self {
            DataType::OrganizationNotificationAddresses | DataType::OfficialAddresses => {
                Pagination::NextLink
            }
            _ => Pagination::CursorRequery,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown data type: {s}")))
    }
}

/// Position in an upstream change log.
///
/// Ordering is only meaningful between identifiers of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChangeId {
    Sequence(i64),
    Timestamp(DateTime<Utc>),
}

impl ChangeId {
    /// Start-of-time sentinel used when no cursor is stored.
    pub fn min_for(kind: CursorKind) -> Self {
        match kind {
            CursorKind::Sequence => ChangeId::Sequence(0),
            CursorKind::Timestamp => ChangeId::Timestamp(
                NaiveDate::from_ymd_opt(1, 1, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }

    pub fn kind(&self) -> CursorKind {
        match self {
            ChangeId::Sequence(_) => CursorKind::Sequence,
            ChangeId::Timestamp(_) => CursorKind::Timestamp,
        }
    }

    pub fn parse(kind: CursorKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match kind {
            CursorKind::Sequence => raw
                .parse::<i64>()
                .map(ChangeId::Sequence)
                .map_err(|e| Error::InvalidInput(format!("invalid sequence cursor '{raw}': {e}"))),
            CursorKind::Timestamp => DateTime::parse_from_rfc3339(raw)
                .map(|dt| ChangeId::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| {
                    Error::InvalidInput(format!("invalid timestamp cursor '{raw}': {e}"))
                }),
        }
    }

    /// Whether saving `self` over `stored` moves the cursor forward. A kind
    /// mismatch is an error.
    pub fn advances(&self, stored: Option<ChangeId>) -> Result<bool> {
        match stored {
            None => Ok(true),
            Some(old) if old.kind() != self.kind() => Err(Error::InvalidInput(format!(
                "cursor {self} is a different kind than stored cursor {old}"
            ))),
            Some(old) => Ok(*self > old),
        }
    }

    /// Text form used for persistence and upstream query parameters.
    pub fn to_cursor_string(&self) -> String {
        match self {
            ChangeId::Sequence(n) => n.to_string(),
            ChangeId::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cursor_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(alias = "insert", alias = "INSERT")]
    Insert,
    #[serde(alias = "update", alias = "UPDATE")]
    Update,
    #[serde(alias = "delete", alias = "DELETE")]
    Delete,
}

/// One upstream change record with its payload still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub operation: OperationType,
    pub data_type: DataType,
    pub change_id: ChangeId,
    pub payload: String,
}

/// Ordered batch of change entries. An empty page ends a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub entries: Vec<ChangeEntry>,
    /// Absolute reference to the next page, for sources that paginate by link.
    pub continuation: Option<String>,
}

impl Page {
    pub fn new(entries: Vec<ChangeEntry>) -> Self {
        Self {
            entries,
            continuation: None,
        }
    }

    pub fn with_continuation(mut self, link: impl Into<String>) -> Self {
        self.continuation = Some(link.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_change_id(&self) -> Option<ChangeId> {
        self.entries.last().map(|e| e.change_id)
    }
}

/// What the engine asks the upstream for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    Since { cursor: ChangeId, page_size: u32 },
    Continue { link: String },
}

/// A change entry whose payload decoded successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChange<P> {
    pub operation: OperationType,
    pub change_id: ChangeId,
    pub payload: P,
}
