use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use imcache_core::{
    AuditEntry, CoordinateDraft, DailyImageDraft, DailyImageRecord, LayerCatalogEntry, LayerDraft,
    LayerFilter, NamedCoordinate, NewAuditEntry, Page, PageRequest, StatusSummary, ViewConfig,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A natural-key uniqueness constraint rejected the write.
    #[error("constraint violation: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSearch {
    pub layers: Vec<LayerCatalogEntry>,
    /// Match count before `limit` is applied.
    pub total: usize,
}

/// Keyed persistent store. Natural keys are unique at this layer; the
/// reconciler relies on that as its only guard against duplicate rows.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_daily_image_by_date(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyImageRecord>, StoreError>;

    async fn get_daily_image(&self, id: i64) -> Result<Option<DailyImageRecord>, StoreError>;

    async fn insert_daily_image(
        &self,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError>;

    /// Overwrites every content field of the row and bumps `updated_at`.
    async fn replace_daily_image(
        &self,
        id: i64,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError>;

    /// Deleting an image nulls every coordinate back-reference to it.
    async fn delete_daily_image(&self, id: i64) -> Result<bool, StoreError>;

    /// Newest date first.
    async fn list_daily_images(
        &self,
        page: PageRequest,
    ) -> Result<Page<DailyImageRecord>, StoreError>;

    async fn find_layer(&self, layer_id: &str) -> Result<Option<LayerCatalogEntry>, StoreError>;

    async fn insert_layer(
        &self,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError>;

    async fn replace_layer(
        &self,
        id: i64,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError>;

    /// Ordered by category then title.
    async fn search_layers(&self, filter: &LayerFilter) -> Result<LayerSearch, StoreError>;

    /// Distinct non-empty categories, sorted.
    async fn layer_categories(&self) -> Result<Vec<String>, StoreError>;

    async fn find_coordinate(
        &self,
        name: &str,
        body: &str,
    ) -> Result<Option<NamedCoordinate>, StoreError>;

    async fn insert_coordinate(
        &self,
        draft: &CoordinateDraft,
        now: DateTime<Utc>,
    ) -> Result<NamedCoordinate, StoreError>;

    /// Case-insensitive name substring match, ordered by name.
    async fn search_coordinates(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NamedCoordinate>, StoreError>;

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError>;

    /// Newest first, optionally restricted to entries at or after `since`.
    async fn recent_audit(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, StoreError>;

    /// Deletes entries strictly older than `cutoff`; returns how many went.
    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn load_view_config(&self, session_id: &str) -> Result<Option<ViewConfig>, StoreError>;

    async fn save_view_config(
        &self,
        config: &ViewConfig,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn status_summary(&self) -> Result<StatusSummary, StoreError>;
}
