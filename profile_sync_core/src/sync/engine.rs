use crate::o11y::conventions;
use crate::o11y::metrics::SharedMetrics;
use crate::sync::models::{ChangeId, DataType, DecodedChange, FetchRequest, OperationType, Page};
use crate::sync::traits::{ChangeFeed, ChangeHandler, ChangePayload, CursorStore, PayloadCodec};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Rewrites a page's decoded changes before they are applied.
pub type PageTransform<P> = Arc<dyn Fn(Vec<DecodedChange<P>>) -> Vec<DecodedChange<P>> + Send + Sync>;

pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Per-data-type configuration of the generic engine.
pub struct SyncDefinition<P> {
    pub data_type: DataType,
    pub page_size: u32,
    pub codec: Arc<dyn PayloadCodec<P>>,
    pub transform: Option<PageTransform<P>>,
}

impl<P> SyncDefinition<P> {
    pub fn new(data_type: DataType, codec: Arc<dyn PayloadCodec<P>>) -> Self {
        Self {
            data_type,
            page_size: DEFAULT_PAGE_SIZE,
            codec,
            transform: None,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_transform(mut self, transform: PageTransform<P>) -> Self {
        self.transform = Some(transform);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Upstream returned an empty page, or a page that made no progress.
    Completed,
    /// Stopped between pages because the cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub data_type: DataType,
    pub pages: u64,
    pub applied: u64,
    pub skipped: u64,
    pub start_cursor: ChangeId,
    pub final_cursor: ChangeId,
    pub outcome: SyncOutcome,
}

/// Object-safe view of an engine so jobs can hold one per data type.
#[async_trait]
pub trait SyncRun: Send + Sync {
    fn data_type(&self) -> DataType;
    async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport>;
}

/// Cursor-based change synchronization, generic over the payload model.
///
/// Pages are fetched and applied strictly in order. The cursor is saved only
/// after every entry of a page has been applied; any error aborts the run
/// with the cursor left where the last completed page put it.
pub struct ChangeSyncEngine<P> {
    definition: SyncDefinition<P>,
    feed: Arc<dyn ChangeFeed>,
    handler: Arc<dyn ChangeHandler<P>>,
    cursors: Arc<dyn CursorStore>,
    metrics: SharedMetrics,
}

impl<P: ChangePayload> ChangeSyncEngine<P> {
    pub fn new(
        definition: SyncDefinition<P>,
        feed: Arc<dyn ChangeFeed>,
        handler: Arc<dyn ChangeHandler<P>>,
        cursors: Arc<dyn CursorStore>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            definition,
            feed,
            handler,
            cursors,
            metrics,
        }
    }

    fn job(&self) -> &'static str {
        self.definition.data_type.as_str()
    }

    #[tracing::instrument(level = "info", skip_all, fields(data_type = %self.definition.data_type))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let data_type = self.definition.data_type;
        let kind = data_type.cursor_kind();
        let start_cursor = match self.cursors.load(data_type).await? {
            Some(c) if c.kind() != kind => {
                return Err(Error::InvalidInput(format!(
                    "stored cursor {c} does not match the {kind:?} cursor of {data_type}"
                )));
            }
            Some(c) => c,
            None => ChangeId::min_for(kind),
        };

        let mut report = SyncReport {
            data_type,
            pages: 0,
            applied: 0,
            skipped: 0,
            start_cursor,
            final_cursor: start_cursor,
            outcome: SyncOutcome::Completed,
        };

        match self.run_pages(cancel, &mut report).await {
            Ok(()) => {
                let event = match report.outcome {
                    SyncOutcome::Completed => conventions::SYNC_RUN_COMPLETED,
                    SyncOutcome::Cancelled => conventions::SYNC_RUN_CANCELLED,
                };
                self.metrics.increment(self.job(), event, 1);
                tracing::info!(
                    pages = report.pages,
                    applied = report.applied,
                    skipped = report.skipped,
                    cursor = %report.final_cursor,
                    outcome = ?report.outcome,
                    "sync run finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics
                    .increment(self.job(), conventions::SYNC_RUN_FAILED, 1);
                tracing::warn!(%e, cursor = %report.final_cursor, "sync run aborted");
                Err(e)
            }
        }
    }

    async fn run_pages(&self, cancel: &CancellationToken, report: &mut SyncReport) -> Result<()> {
        let data_type = self.definition.data_type;
        let mut cursor = report.final_cursor;
        let mut continuation: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                report.outcome = SyncOutcome::Cancelled;
                return Ok(());
            }

            let request = match continuation.take() {
                Some(link) => FetchRequest::Continue { link },
                None => FetchRequest::Since {
                    cursor,
                    page_size: self.definition.page_size,
                },
            };
            let page = self.feed.fetch(data_type, &request).await?;
            let Some(last) = page.last_change_id() else {
                return Ok(());
            };
            report.pages += 1;
            self.metrics
                .increment(self.job(), conventions::SYNC_PAGE_FETCHED, 1);

            if last.kind() != cursor.kind() || last < cursor {
                return Err(Error::InvalidInput(format!(
                    "page for {data_type} ends at {last}, behind cursor {cursor}"
                )));
            }

            self.apply_page(&page, report).await?;

            let progressed = last > cursor;
            if progressed {
                self.cursors.save(data_type, last).await?;
                cursor = last;
                report.final_cursor = last;
                self.metrics
                    .increment(self.job(), conventions::SYNC_CURSOR_ADVANCED, 1);
                tracing::debug!(cursor = %last, "cursor advanced");
            }

            match page.continuation {
                Some(link) => continuation = Some(link),
                // Re-querying from an unchanged cursor would return the same page.
                None if !progressed => return Ok(()),
                None => {}
            }
        }
    }

    async fn apply_page(&self, page: &Page, report: &mut SyncReport) -> Result<()> {
        let mut decoded = Vec::with_capacity(page.entries.len());
        for entry in &page.entries {
            match self.definition.codec.decode(&entry.payload) {
                Ok(payload) if !payload.is_identified() => {
                    report.skipped += 1;
                    self.metrics
                        .increment(self.job(), conventions::SYNC_ENTRY_SKIPPED, 1);
                    tracing::warn!(change_id = %entry.change_id, "skipping change entry without an entity key");
                }
                Ok(payload) => decoded.push(DecodedChange {
                    operation: entry.operation,
                    change_id: entry.change_id,
                    payload,
                }),
                Err(e) => {
                    report.skipped += 1;
                    self.metrics
                        .increment(self.job(), conventions::SYNC_ENTRY_SKIPPED, 1);
                    tracing::warn!(change_id = %entry.change_id, %e, "skipping undecodable change entry");
                }
            }
        }

        if let Some(transform) = &self.definition.transform {
            decoded = transform(decoded);
        }

        for change in &decoded {
            match change.operation {
                OperationType::Insert | OperationType::Update => {
                    self.handler
                        .apply_upsert(&change.payload, change.change_id)
                        .await?
                }
                OperationType::Delete => {
                    self.handler
                        .apply_delete(&change.payload.entity_key(), change.change_id)
                        .await?
                }
            }
            report.applied += 1;
        }
        if !decoded.is_empty() {
            self.metrics.increment(
                self.job(),
                conventions::SYNC_ENTRY_APPLIED,
                decoded.len() as u64,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<P: ChangePayload> SyncRun for ChangeSyncEngine<P> {
    fn data_type(&self) -> DataType {
        self.definition.data_type
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        ChangeSyncEngine::run(self, cancel).await
    }
}
