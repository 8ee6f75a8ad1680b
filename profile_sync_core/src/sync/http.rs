//! Change feed backed by the upstream registries' JSON change-log endpoints.

use crate::sync::models::{
    ChangeEntry, ChangeId, CursorKind, DataType, FetchRequest, OperationType, Page,
};
use crate::sync::traits::ChangeFeed;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct WirePage {
    // Decoded one by one so a single bad entry does not sink the page.
    #[serde(default)]
    entries: Vec<serde_json::Value>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    operation: OperationType,
    change_id: serde_json::Value,
    #[serde(default)]
    payload: serde_json::Value,
}

/// `GET {endpoint}?since=<cursor>&pageSize=<n>`, or the absolute `next` link
/// of the previous page.
#[derive(Debug, Clone)]
pub struct HttpChangeFeed {
    http: Client,
    endpoints: HashMap<DataType, String>,
}

impl HttpChangeFeed {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            http,
            endpoints: HashMap::new(),
        })
    }

    pub fn with_endpoint(mut self, data_type: DataType, url: impl Into<String>) -> Self {
        self.endpoints.insert(data_type, url.into());
        self
    }

    pub fn has_endpoint(&self, data_type: DataType) -> bool {
        self.endpoints.contains_key(&data_type)
    }

    fn endpoint(&self, data_type: DataType) -> Result<&str> {
        self.endpoints
            .get(&data_type)
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(format!("no upstream endpoint for {data_type}")))
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, data_type: DataType, request: &FetchRequest) -> Result<Page> {
        let req = match request {
            FetchRequest::Since { cursor, page_size } => self
                .http
                .get(self.endpoint(data_type)?)
                .query(&[
                    ("since", cursor.to_cursor_string()),
                    ("pageSize", page_size.to_string()),
                ]),
            FetchRequest::Continue { link } => self.http.get(link),
        };
        let resp = req.send().await.map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::UpstreamServer {
                status: status.as_u16(),
                message: text,
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                message: format!("{data_type} change feed returned {status}: {text}"),
            });
        }

        let body = resp.text().await.map_err(Error::backend_reqwest)?;
        let wire: WirePage = serde_json::from_str(&body).map_err(|e| Error::Upstream {
            message: format!("malformed {data_type} change page: {e}"),
        })?;

        let kind = data_type.cursor_kind();
        let mut entries = Vec::with_capacity(wire.entries.len());
        for (index, raw) in wire.entries.into_iter().enumerate() {
            match decode_entry(data_type, kind, raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(%data_type, index, %e, "skipping malformed change entry");
                }
            }
        }

        Ok(Page {
            entries,
            continuation: wire.next.filter(|n| !n.trim().is_empty()),
        })
    }
}

fn decode_entry(data_type: DataType, kind: CursorKind, raw: serde_json::Value) -> Result<ChangeEntry> {
    let entry: WireEntry = serde_json::from_value(raw)
        .map_err(|e| Error::InvalidInput(format!("malformed change entry: {e}")))?;
    let raw_id = match &entry.change_id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let change_id = ChangeId::parse(kind, &raw_id)?;
    // Payloads arrive either as embedded JSON or as an already-serialized string.
    let payload = match entry.payload {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    Ok(ChangeEntry {
        operation: entry.operation,
        data_type,
        change_id,
        payload,
    })
}
