use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use imcache_core::{
    AuditEntry, AuditLevel, CoordinateDraft, DailyImageDraft, DailyImageRecord, LayerCatalogEntry,
    LayerDraft, LayerFilter, NamedCoordinate, NewAuditEntry, Page, PageRequest, StatusSummary,
    TemporalResolution, ViewConfig,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::store::{LayerSearch, Store, StoreError};

const DAILY_COLUMNS: &str = "id, image_date, title, explanation, url, hd_url, media_type, \
     copyright, thumbnail_url, created_at, updated_at";

const LAYER_COLUMNS: &str = "id, layer_id, title, subtitle, description, format, projection, \
     start_date, end_date, temporal_resolution, category, tags, source, wraparound, \
     created_at, updated_at";

const COORDINATE_COLUMNS: &str =
    "id, name, body, kind, latitude, longitude, description, daily_image_id, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("migration failed: {err}")))?;
        info!("database migrations applied");
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn daily_from_row(row: &PgRow) -> Result<DailyImageRecord, StoreError> {
    Ok(DailyImageRecord {
        id: row.try_get("id").map_err(map_sqlx)?,
        date: row.try_get("image_date").map_err(map_sqlx)?,
        title: row.try_get("title").map_err(map_sqlx)?,
        explanation: row.try_get("explanation").map_err(map_sqlx)?,
        url: row.try_get("url").map_err(map_sqlx)?,
        hd_url: row.try_get("hd_url").map_err(map_sqlx)?,
        media_type: row.try_get("media_type").map_err(map_sqlx)?,
        copyright: row.try_get("copyright").map_err(map_sqlx)?,
        thumbnail_url: row.try_get("thumbnail_url").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn layer_from_row(row: &PgRow) -> Result<LayerCatalogEntry, StoreError> {
    let resolution: String = row.try_get("temporal_resolution").map_err(map_sqlx)?;
    let temporal_resolution = resolution
        .parse::<TemporalResolution>()
        .map_err(StoreError::Backend)?;
    let Json(tags): Json<Vec<String>> = row.try_get("tags").map_err(map_sqlx)?;
    Ok(LayerCatalogEntry {
        id: row.try_get("id").map_err(map_sqlx)?,
        layer_id: row.try_get("layer_id").map_err(map_sqlx)?,
        title: row.try_get("title").map_err(map_sqlx)?,
        subtitle: row.try_get("subtitle").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        format: row.try_get("format").map_err(map_sqlx)?,
        projection: row.try_get("projection").map_err(map_sqlx)?,
        start_date: row.try_get("start_date").map_err(map_sqlx)?,
        end_date: row.try_get("end_date").map_err(map_sqlx)?,
        temporal_resolution,
        category: row.try_get("category").map_err(map_sqlx)?,
        tags,
        source: row.try_get("source").map_err(map_sqlx)?,
        wraparound: row.try_get("wraparound").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn coordinate_from_row(row: &PgRow) -> Result<NamedCoordinate, StoreError> {
    Ok(NamedCoordinate {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        body: row.try_get("body").map_err(map_sqlx)?,
        kind: row.try_get("kind").map_err(map_sqlx)?,
        latitude: row.try_get("latitude").map_err(map_sqlx)?,
        longitude: row.try_get("longitude").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        daily_image_id: row.try_get("daily_image_id").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry, StoreError> {
    let level: String = row.try_get("level").map_err(map_sqlx)?;
    Ok(AuditEntry {
        id: row.try_get("id").map_err(map_sqlx)?,
        timestamp: row.try_get("logged_at").map_err(map_sqlx)?,
        level: level.parse::<AuditLevel>().map_err(StoreError::Backend)?,
        message: row.try_get("message").map_err(map_sqlx)?,
        details: row.try_get("details").map_err(map_sqlx)?,
    })
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

#[async_trait]
impl Store for PgStore {
    async fn find_daily_image_by_date(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyImageRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DAILY_COLUMNS} FROM daily_images WHERE image_date = $1"
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(daily_from_row).transpose()
    }

    async fn get_daily_image(&self, id: i64) -> Result<Option<DailyImageRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DAILY_COLUMNS} FROM daily_images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(daily_from_row).transpose()
    }

    async fn insert_daily_image(
        &self,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO daily_images
                (image_date, title, explanation, url, hd_url, media_type, copyright,
                 thumbnail_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING {DAILY_COLUMNS}
            "#
        ))
        .bind(draft.date)
        .bind(&draft.title)
        .bind(&draft.explanation)
        .bind(&draft.url)
        .bind(&draft.hd_url)
        .bind(&draft.media_type)
        .bind(&draft.copyright)
        .bind(&draft.thumbnail_url)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        daily_from_row(&row)
    }

    async fn replace_daily_image(
        &self,
        id: i64,
        draft: &DailyImageDraft,
        now: DateTime<Utc>,
    ) -> Result<DailyImageRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE daily_images
               SET image_date = $2,
                   title = $3,
                   explanation = $4,
                   url = $5,
                   hd_url = $6,
                   media_type = $7,
                   copyright = $8,
                   thumbnail_url = $9,
                   updated_at = $10
             WHERE id = $1
            RETURNING {DAILY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(draft.date)
        .bind(&draft.title)
        .bind(&draft.explanation)
        .bind(&draft.url)
        .bind(&draft.hd_url)
        .bind(&draft.media_type)
        .bind(&draft.copyright)
        .bind(&draft.thumbnail_url)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref()
            .map(daily_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound)
    }

    async fn delete_daily_image(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM daily_images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_daily_images(
        &self,
        page: PageRequest,
    ) -> Result<Page<DailyImageRecord>, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM daily_images")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(map_sqlx)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DAILY_COLUMNS}
              FROM daily_images
             ORDER BY image_date DESC
             LIMIT $1 OFFSET $2
            "#
        ))
        .bind(to_i64(page.per_page))
        .bind(to_i64(page.offset()))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let items = rows.iter().map(daily_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total: to_usize(total),
        })
    }

    async fn find_layer(&self, layer_id: &str) -> Result<Option<LayerCatalogEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {LAYER_COLUMNS} FROM layers WHERE layer_id = $1"))
            .bind(layer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(layer_from_row).transpose()
    }

    async fn insert_layer(
        &self,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO layers
                (layer_id, title, subtitle, description, format, projection, start_date,
                 end_date, temporal_resolution, category, tags, source, wraparound,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING {LAYER_COLUMNS}
            "#
        ))
        .bind(&draft.layer_id)
        .bind(&draft.title)
        .bind(&draft.subtitle)
        .bind(&draft.description)
        .bind(&draft.format)
        .bind(&draft.projection)
        .bind(draft.start_date)
        .bind(draft.end_date)
        .bind(draft.temporal_resolution.as_str())
        .bind(&draft.category)
        .bind(Json(&draft.tags))
        .bind(&draft.source)
        .bind(draft.wraparound)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        layer_from_row(&row)
    }

    async fn replace_layer(
        &self,
        id: i64,
        draft: &LayerDraft,
        now: DateTime<Utc>,
    ) -> Result<LayerCatalogEntry, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE layers
               SET layer_id = $2,
                   title = $3,
                   subtitle = $4,
                   description = $5,
                   format = $6,
                   projection = $7,
                   start_date = $8,
                   end_date = $9,
                   temporal_resolution = $10,
                   category = $11,
                   tags = $12,
                   source = $13,
                   wraparound = $14,
                   updated_at = $15
             WHERE id = $1
            RETURNING {LAYER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&draft.layer_id)
        .bind(&draft.title)
        .bind(&draft.subtitle)
        .bind(&draft.description)
        .bind(&draft.format)
        .bind(&draft.projection)
        .bind(draft.start_date)
        .bind(draft.end_date)
        .bind(draft.temporal_resolution.as_str())
        .bind(&draft.category)
        .bind(Json(&draft.tags))
        .bind(&draft.source)
        .bind(draft.wraparound)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref()
            .map(layer_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound)
    }

    async fn search_layers(&self, filter: &LayerFilter) -> Result<LayerSearch, StoreError> {
        let pattern = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{q}%"));
        let where_clause = r#"
             WHERE ($1::text IS NULL
                    OR title ILIKE $1
                    OR description ILIKE $1
                    OR layer_id ILIKE $1)
               AND ($2::text IS NULL OR category = $2)
        "#;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM layers {where_clause}"))
            .bind(&pattern)
            .bind(&filter.category)
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(map_sqlx)?;

        let rows = sqlx::query(&format!(
            "SELECT {LAYER_COLUMNS} FROM layers {where_clause} ORDER BY category, title LIMIT $3"
        ))
        .bind(&pattern)
        .bind(&filter.category)
        .bind(filter.limit.map(to_i64))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(LayerSearch {
            layers: rows.iter().map(layer_from_row).collect::<Result<Vec<_>, _>>()?,
            total: to_usize(total),
        })
    }

    async fn layer_categories(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT category
              FROM layers
             WHERE category <> ''
             ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| row.try_get("category").map_err(map_sqlx))
            .collect()
    }

    async fn find_coordinate(
        &self,
        name: &str,
        body: &str,
    ) -> Result<Option<NamedCoordinate>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COORDINATE_COLUMNS} FROM named_coordinates WHERE name = $1 AND body = $2"
        ))
        .bind(name)
        .bind(body)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(coordinate_from_row).transpose()
    }

    async fn insert_coordinate(
        &self,
        draft: &CoordinateDraft,
        now: DateTime<Utc>,
    ) -> Result<NamedCoordinate, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO named_coordinates
                (name, body, kind, latitude, longitude, description, daily_image_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {COORDINATE_COLUMNS}
            "#
        ))
        .bind(&draft.name)
        .bind(&draft.body)
        .bind(&draft.kind)
        .bind(draft.latitude)
        .bind(draft.longitude)
        .bind(&draft.description)
        .bind(draft.daily_image_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        coordinate_from_row(&row)
    }

    async fn search_coordinates(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NamedCoordinate>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COORDINATE_COLUMNS}
              FROM named_coordinates
             WHERE name ILIKE $1
             ORDER BY name
             LIMIT $2
            "#
        ))
        .bind(format!("%{}%", query.trim()))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(coordinate_from_row).collect()
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO audit_entries (logged_at, level, message, details)
            VALUES ($1, $2, $3, $4)
            RETURNING id, logged_at, level, message, details
            "#,
        )
        .bind(entry.timestamp)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.details)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        audit_from_row(&row)
    }

    async fn recent_audit(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, logged_at, level, message, details
              FROM audit_entries
             WHERE ($1::timestamptz IS NULL OR logged_at >= $1)
             ORDER BY logged_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(since)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_entries WHERE logged_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn load_view_config(&self, session_id: &str) -> Result<Option<ViewConfig>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, active_layers, layer_opacity, center_lat, center_lon,
                   zoom_level, projection, view_date
              FROM view_configs
             WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Json(active_layers): Json<Vec<String>> =
            row.try_get("active_layers").map_err(map_sqlx)?;
        let Json(layer_opacity): Json<BTreeMap<String, f64>> =
            row.try_get("layer_opacity").map_err(map_sqlx)?;
        Ok(Some(ViewConfig {
            session_id: row.try_get("session_id").map_err(map_sqlx)?,
            active_layers,
            layer_opacity,
            center_lat: row.try_get("center_lat").map_err(map_sqlx)?,
            center_lon: row.try_get("center_lon").map_err(map_sqlx)?,
            zoom_level: row.try_get("zoom_level").map_err(map_sqlx)?,
            projection: row.try_get("projection").map_err(map_sqlx)?,
            current_date: row.try_get("view_date").map_err(map_sqlx)?,
        }))
    }

    async fn save_view_config(
        &self,
        config: &ViewConfig,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO view_configs
                (session_id, active_layers, layer_opacity, center_lat, center_lon,
                 zoom_level, projection, view_date, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id) DO UPDATE
               SET active_layers = EXCLUDED.active_layers,
                   layer_opacity = EXCLUDED.layer_opacity,
                   center_lat = EXCLUDED.center_lat,
                   center_lon = EXCLUDED.center_lon,
                   zoom_level = EXCLUDED.zoom_level,
                   projection = EXCLUDED.projection,
                   view_date = EXCLUDED.view_date,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&config.session_id)
        .bind(Json(&config.active_layers))
        .bind(Json(&config.layer_opacity))
        .bind(config.center_lat)
        .bind(config.center_lon)
        .bind(config.zoom_level)
        .bind(&config.projection)
        .bind(config.current_date)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn status_summary(&self) -> Result<StatusSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM daily_images) AS total_images,
                   (SELECT MAX(image_date) FROM daily_images) AS latest_date,
                   (SELECT MIN(image_date) FROM daily_images) AS oldest_date,
                   (SELECT COUNT(*) FROM named_coordinates) AS total_coordinates,
                   (SELECT COUNT(*) FROM layers) AS total_layers,
                   (SELECT COUNT(*) FROM audit_entries) AS total_audit_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let count = |column: &str| -> Result<usize, StoreError> {
            row.try_get::<i64, _>(column).map(to_usize).map_err(map_sqlx)
        };
        Ok(StatusSummary {
            total_images: count("total_images")?,
            latest_date: row.try_get("latest_date").map_err(map_sqlx)?,
            oldest_date: row.try_get("oldest_date").map_err(map_sqlx)?,
            total_coordinates: count("total_coordinates")?,
            total_layers: count("total_layers")?,
            total_audit_entries: count("total_audit_entries")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(map_sqlx(sqlx::Error::RowNotFound), StoreError::NotFound));
        assert!(matches!(
            map_sqlx(sqlx::Error::PoolTimedOut),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn count_conversions_saturate() {
        assert_eq!(to_usize(-1), 0);
        assert_eq!(to_i64(30), 30);
        assert_eq!(to_i64(usize::MAX), i64::MAX);
    }
}
