use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use imcache_adapters::{AdapterError, RawRecord, RemoteSource, SourceQuery};
use imcache_core::{
    AuditLevel, EntityKind, LayerFilter, NaturalKey, NewAuditEntry, Outcome, PageRequest,
};
use imcache_storage::{MemoryStore, Store};
use imcache_sync::{SyncDriver, SyncMode};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

fn raw(value: JsonValue) -> RawRecord {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
}

/// Daily source whose titles can be swapped between runs.
struct Daily {
    title: Mutex<String>,
}

impl Daily {
    fn new(title: &str) -> Arc<Self> {
        Arc::new(Self {
            title: Mutex::new(title.to_string()),
        })
    }
}

#[async_trait]
impl RemoteSource for Daily {
    fn source_id(&self) -> &'static str {
        "test-daily"
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::DailyImage
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
        let date = match query {
            SourceQuery::Date(date) => *date,
            SourceQuery::Latest => day(10),
            SourceQuery::FullCatalog => return Err(AdapterError::Validation("unsupported".into())),
        };
        let title = self.title.lock().await.clone();
        Ok(vec![raw(json!({
            "date": date.to_string(),
            "title": title,
            "explanation": format!("{title} over {date}"),
            "url": format!("https://apod.example/{date}.jpg"),
            "media_type": "image",
        }))])
    }
}

/// Catalog source serving a fixed list of raw layers.
struct Catalog {
    layers: Mutex<Vec<RawRecord>>,
}

impl Catalog {
    fn new(layers: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            layers: Mutex::new(layers),
        })
    }
}

#[async_trait]
impl RemoteSource for Catalog {
    fn source_id(&self) -> &'static str {
        "test-catalog"
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::LayerCatalog
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
        match query {
            SourceQuery::FullCatalog => Ok(self.layers.lock().await.clone()),
            _ => Err(AdapterError::Validation("catalog only".into())),
        }
    }
}

fn layer(id: &str, title: &str) -> RawRecord {
    raw(json!({
        "identifier": id,
        "title": title,
        "abstract": format!("{title} imagery"),
        "format": "image/png",
        "time_values": ["2000-02-24/2025-03-09/P1D"],
    }))
}

const CATALOG_SYNC: SyncMode = SyncMode::FullCatalog {
    force: false,
    verify_tiles: false,
};

const CATALOG_FORCE: SyncMode = SyncMode::FullCatalog {
    force: true,
    verify_tiles: false,
};

fn ten_layers() -> Vec<RawRecord> {
    (0..10)
        .map(|i| layer(&format!("MODIS_Terra_Layer_{i}"), &format!("Layer {i}")))
        .collect()
}

#[tokio::test]
async fn catalog_sync_is_idempotent_without_force() {
    let store = Arc::new(MemoryStore::new());
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), Catalog::new(ten_layers()));

    let first = driver.run(CATALOG_SYNC).await;
    assert_eq!(first.tally.created, 10);
    let before = store.search_layers(&LayerFilter::default()).await.unwrap();

    let second = driver.run(CATALOG_SYNC).await;
    assert_eq!(second.tally.created, 0);
    assert_eq!(second.tally.skipped, 10);
    let after = store.search_layers(&LayerFilter::default()).await.unwrap();
    assert_eq!(before.layers, after.layers);
}

#[tokio::test]
async fn force_overwrite_replaces_existing_layers() {
    let store = Arc::new(MemoryStore::new());
    let catalog = Catalog::new(vec![layer("MODIS_Terra_Snow_Cover", "Snow")]);
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), catalog.clone());
    driver.run(CATALOG_SYNC).await;

    *catalog.layers.lock().await = vec![raw(json!({
        "identifier": "MODIS_Terra_Snow_Cover",
        "title": "Snow Cover (v2)",
        "format": "image/jpeg",
    }))];

    let skipped = driver.run(CATALOG_SYNC).await;
    assert_eq!(skipped.items[0].outcome, Some(Outcome::Skipped));
    assert_eq!(store.find_layer("MODIS_Terra_Snow_Cover").await.unwrap().unwrap().title, "Snow");

    let forced = driver.run(CATALOG_FORCE).await;
    assert_eq!(forced.items[0].outcome, Some(Outcome::Updated));
    let stored = store.find_layer("MODIS_Terra_Snow_Cover").await.unwrap().unwrap();
    assert_eq!(stored.title, "Snow Cover (v2)");
    assert_eq!(stored.format, "jpg");
    assert_eq!(stored.description, "");
    assert_eq!(stored.start_date, None);
}

#[tokio::test]
async fn daily_images_refresh_on_every_fetch() {
    let store = Arc::new(MemoryStore::new());
    let daily = Daily::new("Old Title");
    let driver = SyncDriver::new(store.clone(), daily.clone(), Catalog::new(vec![]));

    let first = driver.run(SyncMode::SingleDate(day(9))).await;
    assert_eq!(first.items[0].outcome, Some(Outcome::Created));

    *daily.title.lock().await = "New Title".to_string();
    let second = driver.run(SyncMode::SingleDate(day(9))).await;
    assert_eq!(second.items[0].outcome, Some(Outcome::Updated));

    let stored = store.find_daily_image_by_date(day(9)).await.unwrap().unwrap();
    assert_eq!(stored.title, "New Title");
    assert_eq!(stored.explanation, "New Title over 2025-03-09");
    let page = store.list_daily_images(PageRequest::new(Some(1), Some(30), 30)).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn backfill_covers_the_trailing_window() {
    let store = Arc::new(MemoryStore::new());
    let driver = SyncDriver::new(store.clone(), Daily::new("APOD"), Catalog::new(vec![]));

    let report = driver.backfill_from(day(10), 3).await;
    let keys = report.items.iter().map(|i| i.key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["2025-03-09", "2025-03-08", "2025-03-07"]);
    assert_eq!((report.success_count(), report.total()), (3, 3));
    assert!(store.find_daily_image_by_date(day(10)).await.unwrap().is_none());

    let page = store.list_daily_images(PageRequest::new(Some(1), Some(30), 30)).await.unwrap();
    let dates = page.items.iter().map(|r| r.date).collect::<Vec<_>>();
    assert_eq!(dates, vec![day(9), day(8), day(7)]);
}

#[tokio::test]
async fn uncategorized_layers_use_the_keyword_tier() {
    let store = Arc::new(MemoryStore::new());
    let catalog = Catalog::new(vec![
        layer("MODIS_Terra_Snow_Cover", "Snow"),
        layer("MODIS_Combined_Thermal_Anomalies_Fires", "Fires combined"),
        layer("XYZ_Unknown_Layer", "Mystery"),
    ]);
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), catalog);
    driver.run(CATALOG_SYNC).await;

    let category = |id: &'static str| {
        let store = store.clone();
        async move { store.find_layer(id).await.unwrap().unwrap().category }
    };
    assert_eq!(category("MODIS_Terra_Snow_Cover").await, "Snow Cover");
    assert_eq!(category("MODIS_Combined_Thermal_Anomalies_Fires").await, "Fires");
    assert_eq!(category("XYZ_Unknown_Layer").await, "Other");

    let categories = store.layer_categories().await.unwrap();
    assert!(categories.contains(&"Other".to_string()));
}

#[tokio::test]
async fn one_bad_layer_does_not_sink_the_batch() {
    let rejected = NaturalKey::LayerId {
        layer_id: "MODIS_Terra_Layer_3".into(),
    };
    let store = Arc::new(MemoryStore::new().with_rejected_key(rejected));
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), Catalog::new(ten_layers()));

    let report = driver.run(CATALOG_SYNC).await;
    assert_eq!(report.tally.succeeded(), 9);
    assert_eq!(report.tally.failed, 1);
    assert!(!report.is_success());
    assert_eq!(store.search_layers(&LayerFilter::default()).await.unwrap().total, 9);

    let log = driver.audit().query(50, None).await.unwrap();
    let summaries = log
        .iter()
        .filter(|e| e.message.contains("9 succeeded, 1 failed"))
        .collect::<Vec<_>>();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].level, AuditLevel::Warning);
    assert!(log
        .iter()
        .any(|e| e.level == AuditLevel::Error && e.message.contains("MODIS_Terra_Layer_3")));
}

#[tokio::test]
async fn malformed_layers_are_counted_as_failures() {
    let store = Arc::new(MemoryStore::new());
    let mut layers = ten_layers();
    layers.push(raw(json!({"title": "no identifier"})));
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), Catalog::new(layers));

    let report = driver.run(CATALOG_SYNC).await;
    assert_eq!(report.tally.created, 10);
    assert_eq!(report.tally.failed, 1);
    assert!(report.items.last().unwrap().error.as_deref().unwrap().contains("identifier"));
}

#[tokio::test]
async fn malformed_layers_leave_only_the_run_summary_in_the_audit_log() {
    let store = Arc::new(MemoryStore::new());
    let mut layers = ten_layers();
    layers.insert(3, raw(json!({"title": "no identifier"})));
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), Catalog::new(layers));

    let report = driver.run(CATALOG_SYNC).await;
    assert_eq!(report.tally.failed, 1);

    let log = driver.audit().query(50, None).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].level, AuditLevel::Warning);
    assert!(log[0].message.contains("10 succeeded, 1 failed"));
}

#[tokio::test]
async fn audit_purge_honours_retention() {
    let store = Arc::new(MemoryStore::new());
    let driver = SyncDriver::new(store.clone(), Daily::new("x"), Catalog::new(vec![]));

    let now = Utc::now();
    store
        .append_audit(NewAuditEntry {
            timestamp: now - Duration::days(8),
            level: AuditLevel::Info,
            message: "old".into(),
            details: None,
        })
        .await
        .unwrap();
    store
        .append_audit(NewAuditEntry {
            timestamp: now - Duration::days(6),
            level: AuditLevel::Info,
            message: "recent".into(),
            details: None,
        })
        .await
        .unwrap();

    let purged = driver.purge_audit(Duration::days(7)).await.unwrap();
    assert_eq!(purged, 1);

    let remaining = driver.audit().query(10, None).await.unwrap();
    let messages = remaining.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
    assert!(messages.contains(&"recent"));
    assert!(!messages.contains(&"old"));
}

#[tokio::test]
async fn status_reflects_synced_rows() {
    let store = Arc::new(MemoryStore::new());
    let driver = SyncDriver::new(store.clone(), Daily::new("APOD"), Catalog::new(ten_layers()));
    driver.backfill_from(day(10), 2).await;
    driver.run(CATALOG_SYNC).await;
    driver.seed_coordinates().await;

    let status = driver.status().await.unwrap();
    assert_eq!(status.total_images, 2);
    assert_eq!(status.latest_date, Some(day(9)));
    assert_eq!(status.oldest_date, Some(day(8)));
    assert_eq!(status.total_layers, 10);
    assert_eq!(status.total_coordinates, 10);
}
