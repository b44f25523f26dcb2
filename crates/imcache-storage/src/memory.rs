//! In-process store with the same uniqueness and on-delete rules as the
//! Postgres schema. Backs the test suites and single-process demos.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use imcache_core::{
    AuditEntry, CoordinateDraft, DailyImageDraft, DailyImageRecord, LayerCatalogEntry, LayerDraft,
    LayerFilter, NamedCoordinate, NaturalKey, NewAuditEntry, Page, PageRequest, StatusSummary,
    ViewConfig,
};
use tokio::sync::Mutex;

use crate::store::{LayerSearch, Store, StoreError};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    daily_images: BTreeMap<i64, DailyImageRecord>,
    layers: BTreeMap<i64, LayerCatalogEntry>,
    coordinates: BTreeMap<i64, NamedCoordinate>,
    audit: BTreeMap<i64, AuditEntry>,
    view_configs: BTreeMap<String, ViewConfig>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    rejected: HashSet<NaturalKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write for `key` fail as a storage-layer error.
    #[cfg(feature = "testing")]
    pub fn with_rejected_key(mut self, key: NaturalKey) -> Self {
        self.rejected.insert(key);
        self
    }

    fn check_writable(&self, key: &NaturalKey) -> Result<(), StoreError> {
        if self.rejected.contains(key) {
            return Err(StoreError::Backend(format!("write rejected for {key}")));
        }
        Ok(())
    }
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_daily_image_by_date(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyImageRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .daily_images
            .values()
            .find(|r| r.date == date)
            .cloned())
    }

    async fn get_daily_image(&self, id: i64) -> Result<Option<DailyImageRecord>, StoreError> {
        Ok(self.tables.lock().await.daily_images.get(&id).cloned())
    }

    async fn insert_daily_image(
        &self,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError> {
        self.check_writable(&draft.natural_key())?;
        let mut tables = self.tables.lock().await;
        if tables.daily_images.values().any(|r| r.date == draft.date) {
            return Err(StoreError::Conflict(format!(
                "daily image for {} already exists",
                draft.natural_key()
            )));
        }
        let id = tables.allocate_id();
        let record = DailyImageRecord {
            id,
            date: draft.date,
            title: draft.title.clone(),
            explanation: draft.explanation.clone(),
            url: draft.url.clone(),
            hd_url: draft.hd_url.clone(),
            media_type: draft.media_type.clone(),
            copyright: draft.copyright.clone(),
            thumbnail_url: draft.thumbnail_url.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.daily_images.insert(id, record.clone());
        Ok(record)
    }

    async fn replace_daily_image(
        &self,
        id: i64,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError> {
        self.check_writable(&draft.natural_key())?;
        let mut tables = self.tables.lock().await;
        if tables
            .daily_images
            .values()
            .any(|r| r.date == draft.date && r.id != id)
        {
            return Err(StoreError::Conflict(format!(
                "daily image for {} already exists",
                draft.natural_key()
            )));
        }
        let record = tables.daily_images.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.date = draft.date;
        record.title = draft.title.clone();
        record.explanation = draft.explanation.clone();
        record.url = draft.url.clone();
        record.hd_url = draft.hd_url.clone();
        record.media_type = draft.media_type.clone();
        record.copyright = draft.copyright.clone();
        record.thumbnail_url = draft.thumbnail_url.clone();
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn delete_daily_image(&self, id: i64) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.daily_images.remove(&id).is_none() {
            return Ok(false);
        }
        for coordinate in tables.coordinates.values_mut() {
            if coordinate.daily_image_id == Some(id) {
                coordinate.daily_image_id = None;
            }
        }
        Ok(true)
    }

    async fn list_daily_images(
        &self,
        page: PageRequest,
    ) -> Result<Page<DailyImageRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables.daily_images.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        let total = rows.len();
        let items = rows
            .into_iter()
            .skip(page.offset())
            .take(page.per_page)
            .collect();
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn find_layer(&self, layer_id: &str) -> Result<Option<LayerCatalogEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .layers
            .values()
            .find(|l| l.layer_id == layer_id)
            .cloned())
    }

    async fn insert_layer(
        &self,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError> {
        self.check_writable(&draft.natural_key())?;
        let mut tables = self.tables.lock().await;
        if tables.layers.values().any(|l| l.layer_id == draft.layer_id) {
            return Err(StoreError::Conflict(format!(
                "layer {} already exists",
                draft.layer_id
            )));
        }
        let id = tables.allocate_id();
        let entry = LayerCatalogEntry {
            id,
            layer_id: draft.layer_id.clone(),
            title: draft.title.clone(),
            subtitle: draft.subtitle.clone(),
            description: draft.description.clone(),
            format: draft.format.clone(),
            projection: draft.projection.clone(),
            start_date: draft.start_date,
            end_date: draft.end_date,
            temporal_resolution: draft.temporal_resolution,
            category: draft.category.clone(),
            tags: draft.tags.clone(),
            source: draft.source.clone(),
            wraparound: draft.wraparound,
            created_at: now,
            updated_at: now,
        };
        tables.layers.insert(id, entry.clone());
        Ok(entry)
    }

    async fn replace_layer(
        &self,
        id: i64,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError> {
        self.check_writable(&draft.natural_key())?;
        let mut tables = self.tables.lock().await;
        if tables
            .layers
            .values()
            .any(|l| l.layer_id == draft.layer_id && l.id != id)
        {
            return Err(StoreError::Conflict(format!(
                "layer {} already exists",
                draft.layer_id
            )));
        }
        let entry = tables.layers.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.layer_id = draft.layer_id.clone();
        entry.title = draft.title.clone();
        entry.subtitle = draft.subtitle.clone();
        entry.description = draft.description.clone();
        entry.format = draft.format.clone();
        entry.projection = draft.projection.clone();
        entry.start_date = draft.start_date;
        entry.end_date = draft.end_date;
        entry.temporal_resolution = draft.temporal_resolution;
        entry.category = draft.category.clone();
        entry.tags = draft.tags.clone();
        entry.source = draft.source.clone();
        entry.wraparound = draft.wraparound;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn search_layers(&self, filter: &LayerFilter) -> Result<LayerSearch, StoreError> {
        let tables = self.tables.lock().await;
        let needle = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let mut layers = tables
            .layers
            .values()
            .filter(|l| {
                needle.as_deref().map_or(true, |q| {
                    contains_ci(&l.title, q)
                        || contains_ci(&l.description, q)
                        || contains_ci(&l.layer_id, q)
                })
            })
            .filter(|l| {
                filter
                    .category
                    .as_deref()
                    .map_or(true, |c| l.category == c)
            })
            .cloned()
            .collect::<Vec<_>>();
        layers.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.title.cmp(&b.title))
        });
        let total = layers.len();
        if let Some(limit) = filter.limit {
            layers.truncate(limit);
        }
        Ok(LayerSearch { layers, total })
    }

    async fn layer_categories(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        let mut categories = tables
            .layers
            .values()
            .map(|l| l.category.clone())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }

    async fn find_coordinate(
        &self,
        name: &str,
        body: &str,
    ) -> Result<Option<NamedCoordinate>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .coordinates
            .values()
            .find(|c| c.name == name && c.body == body)
            .cloned())
    }

    async fn insert_coordinate(
        &self,
        draft: &CoordinateDraft,
        now: DateTime<Utc>,
    ) -> Result<NamedCoordinate, StoreError> {
        self.check_writable(&draft.natural_key())?;
        let mut tables = self.tables.lock().await;
        if tables
            .coordinates
            .values()
            .any(|c| c.name == draft.name && c.body == draft.body)
        {
            return Err(StoreError::Conflict(format!(
                "coordinate {} already exists",
                draft.natural_key()
            )));
        }
        if let Some(image_id) = draft.daily_image_id {
            if !tables.daily_images.contains_key(&image_id) {
                return Err(StoreError::Conflict(format!(
                    "daily image {image_id} referenced by {} does not exist",
                    draft.natural_key()
                )));
            }
        }
        let id = tables.allocate_id();
        let coordinate = NamedCoordinate {
            id,
            name: draft.name.clone(),
            body: draft.body.clone(),
            kind: draft.kind.clone(),
            latitude: draft.latitude,
            longitude: draft.longitude,
            description: draft.description.clone(),
            daily_image_id: draft.daily_image_id,
            created_at: now,
        };
        tables.coordinates.insert(id, coordinate.clone());
        Ok(coordinate)
    }

    async fn search_coordinates(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NamedCoordinate>, StoreError> {
        let tables = self.tables.lock().await;
        let needle = query.trim().to_lowercase();
        let mut rows = tables
            .coordinates
            .values()
            .filter(|c| contains_ci(&c.name, &needle))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let mut tables = self.tables.lock().await;
        let id = tables.allocate_id();
        let stored = AuditEntry {
            id,
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
            details: entry.details,
        };
        tables.audit.insert(id, stored.clone());
        Ok(stored)
    }

    async fn recent_audit(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .audit
            .values()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.audit.len();
        tables.audit.retain(|_, e| e.timestamp >= cutoff);
        Ok((before - tables.audit.len()) as u64)
    }

    async fn load_view_config(&self, session_id: &str) -> Result<Option<ViewConfig>, StoreError> {
        Ok(self.tables.lock().await.view_configs.get(session_id).cloned())
    }

    async fn save_view_config(
        &self,
        config: &ViewConfig,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .view_configs
            .insert(config.session_id.clone(), config.clone());
        Ok(())
    }

    async fn status_summary(&self) -> Result<StatusSummary, StoreError> {
        let tables = self.tables.lock().await;
        Ok(StatusSummary {
            total_images: tables.daily_images.len(),
            latest_date: tables.daily_images.values().map(|r| r.date).max(),
            oldest_date: tables.daily_images.values().map(|r| r.date).min(),
            total_coordinates: tables.coordinates.len(),
            total_layers: tables.layers.len(),
            total_audit_entries: tables.audit.len(),
        })
    }
}
