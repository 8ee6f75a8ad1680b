//! Payload models for each synchronized data type, and the engine
//! instantiation that binds them together.

use crate::o11y::metrics::SharedMetrics;
use crate::sync::consolidate::consolidate;
use crate::sync::documents::{DocumentHandler, DocumentStore};
use crate::sync::engine::{ChangeSyncEngine, PageTransform, SyncDefinition, SyncRun};
use crate::sync::models::DataType;
use crate::sync::traits::{ChangeFeed, ChangePayload, CursorStore, JsonCodec};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub person_identifier: String,
    pub resource_id: String,
    pub group_id: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl ChangePayload for Favorite {
    fn entity_key(&self) -> String {
        format!("{}:{}", self.person_identifier, self.resource_id)
    }

    fn is_identified(&self) -> bool {
        !self.person_identifier.trim().is_empty() && !self.resource_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfessionalNotificationSetting {
    pub user_id: String,
    pub party_id: String,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

impl ChangePayload for ProfessionalNotificationSetting {
    fn entity_key(&self) -> String {
        format!("{}:{}", self.user_id, self.party_id)
    }

    fn is_identified(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.party_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalSettings {
    pub user_id: String,
    pub language: Option<String>,
    pub preselected_party: Option<String>,
    #[serde(default)]
    pub do_not_prompt_for_party: bool,
    #[serde(default)]
    pub show_client_units: bool,
    #[serde(default)]
    pub show_sub_entities: bool,
    #[serde(default)]
    pub show_deleted_entities: bool,
}

impl ChangePayload for PortalSettings {
    fn entity_key(&self) -> String {
        self.user_id.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonContactPreference {
    pub person_identifier: String,
    pub language: Option<String>,
    pub email: Option<String>,
    pub mobile_number: Option<String>,
    #[serde(default)]
    pub is_reserved: bool,
    pub email_last_changed: Option<DateTime<Utc>>,
    pub email_last_verified: Option<DateTime<Utc>>,
    pub mobile_last_changed: Option<DateTime<Utc>>,
    pub mobile_last_verified: Option<DateTime<Utc>>,
    pub language_last_changed: Option<DateTime<Utc>>,
}

impl PersonContactPreference {
    /// Grouping key for consolidation.
    pub fn person_key(&self) -> String {
        self.person_identifier.clone()
    }
}

impl ChangePayload for PersonContactPreference {
    fn entity_key(&self) -> String {
        self.person_key()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationNotificationAddress {
    pub organization_number: String,
    pub address_id: String,
    pub address_type: Option<String>,
    pub address: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl ChangePayload for OrganizationNotificationAddress {
    fn entity_key(&self) -> String {
        format!("{}:{}", self.organization_number, self.address_id)
    }

    fn is_identified(&self) -> bool {
        !self.organization_number.trim().is_empty() && !self.address_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialAddress {
    pub organization_number: String,
    pub address_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ChangePayload for OfficialAddress {
    fn entity_key(&self) -> String {
        format!("{}:{}", self.organization_number, self.address_id)
    }

    fn is_identified(&self) -> bool {
        !self.organization_number.trim().is_empty() && !self.address_id.trim().is_empty()
    }
}

/// Collaborators shared by every data type's engine.
#[derive(Clone)]
pub struct SyncDeps {
    pub feed: Arc<dyn ChangeFeed>,
    pub cursors: Arc<dyn CursorStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub metrics: SharedMetrics,
    pub page_size: u32,
}

/// Build the engine for one data type, applying into the document store.
#[tracing::instrument(level = "debug", skip(deps))]
pub fn build_sync(data_type: DataType, deps: &SyncDeps) -> Arc<dyn SyncRun> {
    match data_type {
        DataType::Favorites => engine::<Favorite>(data_type, deps, None),
        DataType::ProfessionalNotificationSettings => {
            engine::<ProfessionalNotificationSetting>(data_type, deps, None)
        }
        DataType::PortalSettings => engine::<PortalSettings>(data_type, deps, None),
        DataType::PersonContactPreferences => {
            let transform: PageTransform<PersonContactPreference> = Arc::new(consolidate);
            engine(data_type, deps, Some(transform))
        }
        DataType::OrganizationNotificationAddresses => {
            engine::<OrganizationNotificationAddress>(data_type, deps, None)
        }
        DataType::OfficialAddresses => engine::<OfficialAddress>(data_type, deps, None),
    }
}

fn engine<P>(
    data_type: DataType,
    deps: &SyncDeps,
    transform: Option<PageTransform<P>>,
) -> Arc<dyn SyncRun>
where
    P: ChangePayload + Serialize + DeserializeOwned,
{
    let mut definition =
        SyncDefinition::new(data_type, Arc::new(JsonCodec::<P>::new())).with_page_size(deps.page_size);
    if let Some(transform) = transform {
        definition = definition.with_transform(transform);
    }
    let handler = Arc::new(DocumentHandler::<P>::new(data_type, deps.documents.clone()));
    Arc::new(ChangeSyncEngine::new(
        definition,
        deps.feed.clone(),
        handler,
        deps.cursors.clone(),
        deps.metrics.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_decode_from_upstream_json() {
        let p: PersonContactPreference = serde_json::from_str(
            r#"{"personIdentifier":"01017012345","email":"a@example.com","emailLastChanged":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(p.entity_key(), "01017012345");
        assert!(p.email_last_changed.is_some());
        assert!(p.mobile_last_changed.is_none());

        let f: Favorite =
            serde_json::from_str(r#"{"personIdentifier":"p1","resourceId":"r9"}"#).unwrap();
        assert_eq!(f.entity_key(), "p1:r9");
        assert!(f.is_identified());
    }

    #[test]
    fn identity_fields_are_required() {
        assert!(serde_json::from_str::<Favorite>(r#"{"unrelated":1}"#).is_err());
        assert!(serde_json::from_str::<PortalSettings>(r#"{"language":"nb"}"#).is_err());
        assert!(serde_json::from_str::<OfficialAddress>(r#"{"organizationNumber":"910"}"#).is_err());

        let blank: Favorite =
            serde_json::from_str(r#"{"personIdentifier":"p1","resourceId":" "}"#).unwrap();
        assert!(!blank.is_identified());

        let settings: PortalSettings = serde_json::from_str(r#"{"userId":"u1"}"#).unwrap();
        assert!(settings.is_identified());
        assert!(!settings.show_client_units);
    }
}
