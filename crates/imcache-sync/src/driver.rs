use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Days, Duration as ChronoDuration, NaiveDate, Utc};
use imcache_adapters::{
    normalize, ApodSource, GibsCapabilitiesSource, RawRecord, RemoteSource, SourceQuery, TileProbe,
    APOD_SOURCE_ID,
};
use imcache_core::{
    AuditLevel, CanonicalRecord, EntityKind, Outcome, OutcomeTally, ReconcileMode, StatusSummary,
    DATE_FORMAT,
};
use imcache_storage::{HttpClientConfig, HttpFetcher, Store};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{AuditLog, Reconciler, SyncConfig, SyncError};

const SEED_COORDINATES_YAML: &str = include_str!("../data/seed_coordinates.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    SingleDate(NaiveDate),
    /// Trailing window of past days, never including today.
    Backfill(u32),
    FullCatalog { force: bool, verify_tiles: bool },
    Latest,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::SingleDate(date) => write!(f, "single date {}", date.format(DATE_FORMAT)),
            SyncMode::Backfill(days) => write!(f, "backfill {days} days"),
            SyncMode::FullCatalog { force, verify_tiles } => {
                write!(f, "full catalog (force={force}, verify_tiles={verify_tiles})")
            }
            SyncMode::Latest => f.write_str("latest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub key: String,
    pub label: Option<String>,
    pub outcome: Option<Outcome>,
    /// Set when tile verification found no imagery for the layer.
    pub unavailable: bool,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tally: OutcomeTally,
    pub unavailable: usize,
    /// In processing order.
    pub items: Vec<ItemResult>,
    /// Request-level failure that stopped the run before any item.
    pub error: Option<String>,
}

impl SyncReport {
    fn start(mode: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode: mode.to_string(),
            started_at: now,
            finished_at: now,
            tally: OutcomeTally::default(),
            unavailable: 0,
            items: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.tally.failed == 0
    }

    pub fn success_count(&self) -> usize {
        self.tally.succeeded()
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed",
            self.tally.succeeded(),
            self.tally.failed
        )
    }

    fn summary_level(&self) -> AuditLevel {
        if self.error.is_some() || (self.tally.failed > 0 && self.tally.succeeded() == 0) {
            AuditLevel::Error
        } else if self.tally.failed > 0 {
            AuditLevel::Warning
        } else {
            AuditLevel::Success
        }
    }

    fn record_outcome(&mut self, key: String, label: Option<String>, outcome: Outcome) {
        self.tally.record(outcome);
        self.items.push(ItemResult {
            key,
            label,
            outcome: Some(outcome),
            unavailable: false,
            error: None,
        });
    }

    fn record_failure(&mut self, key: String, label: Option<String>, err: &SyncError) {
        self.tally.record_failure();
        self.items.push(ItemResult {
            key,
            label,
            outcome: None,
            unavailable: false,
            error: Some(err.to_string()),
        });
    }

    fn record_unavailable(&mut self, key: String, label: Option<String>) {
        self.unavailable += 1;
        self.items.push(ItemResult {
            key,
            label,
            outcome: None,
            unavailable: true,
            error: None,
        });
    }

    fn details(&self) -> serde_json::Value {
        json!({
            "run_id": self.run_id,
            "mode": self.mode,
            "created": self.tally.created,
            "updated": self.tally.updated,
            "skipped": self.tally.skipped,
            "failed": self.tally.failed,
            "unavailable": self.unavailable,
            "items": self.items,
        })
    }
}

/// Runs one sync invocation end to end: fetch, normalize, reconcile, audit.
/// Items are processed sequentially in a deterministic order.
pub struct SyncDriver {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    audit: AuditLog,
    daily: Arc<dyn RemoteSource>,
    catalog: Arc<dyn RemoteSource>,
    tile_probe: Option<TileProbe>,
}

impl SyncDriver {
    pub fn new(
        store: Arc<dyn Store>,
        daily: Arc<dyn RemoteSource>,
        catalog: Arc<dyn RemoteSource>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            store,
            daily,
            catalog,
            tile_probe: None,
        }
    }

    pub fn with_tile_probe(mut self, probe: TileProbe) -> Self {
        self.tile_probe = Some(probe);
        self
    }

    /// Wires the NASA sources over one shared HTTP fetcher.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn Store>) -> Result<Self> {
        let mut http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        if let Some(limit) = config.apod_rate_limit() {
            http_config
                .source_rate_limits
                .insert(APOD_SOURCE_ID.to_string(), limit);
        }
        let http = Arc::new(HttpFetcher::new(http_config)?);
        let daily = ApodSource::new(http.clone(), &config.apod_url, &config.nasa_api_key);
        let catalog = GibsCapabilitiesSource::new(http.clone(), &config.capabilities_url);
        Ok(Self::new(store, Arc::new(daily), Arc::new(catalog)).with_tile_probe(TileProbe::new(http)))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn run(&self, mode: SyncMode) -> SyncReport {
        self.run_at(mode, Utc::now().date_naive()).await
    }

    /// Same as [`SyncDriver::run`] with an explicit "today" for date windows.
    pub async fn run_at(&self, mode: SyncMode, today: NaiveDate) -> SyncReport {
        let mut report = SyncReport::start(&mode.to_string());
        let span = info_span!("sync_run", run_id = %report.run_id, %mode);
        async {
            match mode {
                SyncMode::SingleDate(date) => {
                    self.run_daily(&mut report, SourceQuery::Date(date)).await
                }
                SyncMode::Latest => self.run_daily(&mut report, SourceQuery::Latest).await,
                SyncMode::Backfill(days) => self.run_backfill(&mut report, today, days).await,
                SyncMode::FullCatalog {
                    force,
                    verify_tiles,
                } => {
                    self.run_catalog(&mut report, ReconcileMode::from_force(force), verify_tiles, today)
                        .await
                }
            }
            report.finished_at = Utc::now();
            info!(
                created = report.tally.created,
                updated = report.tally.updated,
                skipped = report.tally.skipped,
                failed = report.tally.failed,
                "sync run finished"
            );
        }
        .instrument(span)
        .await;
        report
    }

    pub async fn backfill_from(&self, today: NaiveDate, days: u32) -> SyncReport {
        self.run_at(SyncMode::Backfill(days), today).await
    }

    /// Fetch, normalize and reconcile one daily image. The key falls back
    /// to the query when nothing usable came back.
    async fn process_daily(
        &self,
        query: SourceQuery,
    ) -> (String, Option<String>, Result<Outcome, SyncError>) {
        let fallback_key = match query {
            SourceQuery::Date(date) => date.format(DATE_FORMAT).to_string(),
            _ => "latest".to_string(),
        };
        let record = match self.fetch_daily(query).await {
            Ok(record) => record,
            Err(err) => return (fallback_key, None, Err(err)),
        };
        let key = record.natural_key().to_string();
        let label = Some(record.label().to_string());
        let outcome = self
            .reconciler
            .reconcile(&record, ReconcileMode::SkipExisting)
            .await;
        (key, label, outcome)
    }

    async fn fetch_daily(&self, query: SourceQuery) -> Result<CanonicalRecord, SyncError> {
        let raw = self.daily.fetch(&query).await?;
        let first = raw.first().ok_or_else(|| {
            SyncError::Validation(format!("source returned no record for {query}"))
        })?;
        Ok(normalize(first, EntityKind::DailyImage)?)
    }

    async fn run_daily(&self, report: &mut SyncReport, query: SourceQuery) {
        let (key, label, result) = self.process_daily(query).await;
        match result {
            Ok(outcome) => {
                report.record_outcome(key.clone(), label.clone(), outcome);
                self.audit
                    .append(
                        AuditLevel::Success,
                        format!(
                            "Fetched daily image for {key}: {} ({outcome})",
                            label.unwrap_or_default()
                        ),
                        Some(report.details()),
                    )
                    .await;
            }
            Err(err) => {
                warn!(%key, %err, "daily image sync failed");
                report.record_failure(key.clone(), label, &err);
                self.audit
                    .append(
                        AuditLevel::Error,
                        format!("Failed to fetch daily image for {key}: {err}"),
                        Some(json!({"key": key, "error_kind": err.kind(), "run_id": report.run_id})),
                    )
                    .await;
            }
        }
    }

    async fn run_backfill(&self, report: &mut SyncReport, today: NaiveDate, days: u32) {
        for offset in 1..=days {
            let Some(date) = today.checked_sub_days(Days::new(u64::from(offset))) else {
                warn!(%today, offset, "backfill window reaches before the earliest date");
                break;
            };
            let (key, label, result) = self.process_daily(SourceQuery::Date(date)).await;
            match result {
                Ok(outcome) => report.record_outcome(key, label, outcome),
                Err(err) => {
                    warn!(%key, %err, "backfill date failed");
                    self.audit
                        .append(
                            AuditLevel::Error,
                            format!("Backfill: failed to fetch daily image for {key}: {err}"),
                            Some(json!({"key": key, "error_kind": err.kind(), "run_id": report.run_id})),
                        )
                        .await;
                    report.record_failure(key, label, &err);
                }
            }
        }

        self.audit
            .append(
                report.summary_level(),
                format!("Backfill of {days} days: {}", report.summary()),
                Some(report.details()),
            )
            .await;
    }

    async fn run_catalog(
        &self,
        report: &mut SyncReport,
        mode: ReconcileMode,
        verify_tiles: bool,
        today: NaiveDate,
    ) {
        let raws: Vec<RawRecord> = match self.catalog.fetch(&SourceQuery::FullCatalog).await {
            Ok(raws) => raws,
            Err(err) => {
                let err = SyncError::from(err);
                error!(%err, "layer catalog fetch failed");
                report.error = Some(err.to_string());
                self.audit
                    .append(
                        AuditLevel::Error,
                        format!("Layer catalog sync failed: {err}"),
                        Some(json!({"error_kind": err.kind(), "run_id": report.run_id})),
                    )
                    .await;
                return;
            }
        };
        info!(layers = raws.len(), "processing layer catalog");

        let probe_date = today.pred_opt().unwrap_or(today);
        let probe = if verify_tiles { self.tile_probe.as_ref() } else { None };

        for (idx, raw) in raws.iter().enumerate() {
            let record = match normalize(raw, self.catalog.entity_kind()) {
                Ok(record) => record,
                Err(err) => {
                    let err = SyncError::from(err);
                    let key = raw
                        .get("identifier")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("#{}", idx + 1));
                    warn!(%key, %err, "skipping malformed layer");
                    report.record_failure(key, None, &err);
                    continue;
                }
            };
            let key = record.natural_key().to_string();
            let label = Some(record.label().to_string());

            if let (Some(probe), CanonicalRecord::Layer(layer)) = (probe, &record) {
                let available = match probe.is_available(layer, probe_date).await {
                    Ok(available) => available,
                    Err(err) => {
                        warn!(%key, %err, "tile probe failed");
                        false
                    }
                };
                if !available {
                    report.record_unavailable(key, label);
                    continue;
                }
            }

            match self.reconciler.reconcile(&record, mode).await {
                Ok(outcome) => report.record_outcome(key, label, outcome),
                Err(err) => {
                    error!(%key, %err, "failed to store layer");
                    self.audit
                        .append(
                            AuditLevel::Error,
                            format!("Failed to store layer {key}: {err}"),
                            Some(json!({"key": key, "error_kind": err.kind(), "run_id": report.run_id})),
                        )
                        .await;
                    report.record_failure(key, label, &err);
                }
            }
        }

        let mut message = format!(
            "Layer catalog sync: {} (created {}, updated {}, skipped {})",
            report.summary(),
            report.tally.created,
            report.tally.updated,
            report.tally.skipped
        );
        if report.unavailable > 0 {
            message.push_str(&format!(", {} unavailable", report.unavailable));
        }
        self.audit
            .append(report.summary_level(), message, Some(report.details()))
            .await;
    }

    /// Get-or-create of the built-in named coordinates. Existing
    /// `(name, body)` pairs are left as they are.
    pub async fn seed_coordinates(&self) -> SyncReport {
        let mut report = SyncReport::start("seed coordinates");
        let raws: Vec<RawRecord> = match serde_yaml::from_str(SEED_COORDINATES_YAML) {
            Ok(raws) => raws,
            Err(err) => {
                let err = SyncError::Parse(format!("seed coordinates: {err}"));
                report.error = Some(err.to_string());
                self.audit
                    .append(AuditLevel::Error, format!("Seeding coordinates failed: {err}"), None)
                    .await;
                return report;
            }
        };

        for raw in &raws {
            let record = match normalize(raw, EntityKind::NamedCoordinate) {
                Ok(record) => record,
                Err(err) => {
                    let key = raw
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<unnamed>")
                        .to_string();
                    report.record_failure(key, None, &err.into());
                    continue;
                }
            };
            let key = record.natural_key().to_string();
            let label = Some(record.label().to_string());
            match self
                .reconciler
                .reconcile(&record, ReconcileMode::SkipExisting)
                .await
            {
                Ok(outcome) => report.record_outcome(key, label, outcome),
                Err(err) => {
                    self.audit
                        .append(
                            AuditLevel::Error,
                            format!("Failed to store coordinate {key}: {err}"),
                            None,
                        )
                        .await;
                    report.record_failure(key, label, &err);
                }
            }
        }

        report.finished_at = Utc::now();
        self.audit
            .append(
                report.summary_level(),
                format!(
                    "Seeded coordinates: created {}, already present {}, failed {}",
                    report.tally.created, report.tally.skipped, report.tally.failed
                ),
                None,
            )
            .await;
        report
    }

    pub async fn purge_audit(&self, older_than: ChronoDuration) -> Result<u64, SyncError> {
        let purged = self.audit.purge(older_than).await?;
        self.audit
            .append(
                AuditLevel::Info,
                format!(
                    "Purged {purged} audit entries older than {} days",
                    older_than.num_days()
                ),
                None,
            )
            .await;
        Ok(purged)
    }

    pub async fn status(&self) -> Result<StatusSummary, SyncError> {
        Ok(self.store.status_summary().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use imcache_adapters::AdapterError;
    use imcache_storage::MemoryStore;
    use serde_json::Value as JsonValue;
    use tokio::sync::Mutex;

    /// Serves canned daily records and remembers every query it saw.
    #[derive(Default)]
    struct StubDaily {
        seen: Mutex<Vec<SourceQuery>>,
        failing: Vec<NaiveDate>,
    }

    fn daily_raw(date: NaiveDate, title: &str) -> RawRecord {
        match json!({
            "date": date.format(DATE_FORMAT).to_string(),
            "title": title,
            "explanation": "",
            "url": format!("https://apod.example/{date}.jpg"),
        }) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[async_trait]
    impl RemoteSource for StubDaily {
        fn source_id(&self) -> &'static str {
            "stub-daily"
        }

        fn entity_kind(&self) -> EntityKind {
            EntityKind::DailyImage
        }

        async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
            self.seen.lock().await.push(*query);
            match query {
                SourceQuery::Date(date) if self.failing.contains(date) => Err(AdapterError::Transport {
                    status: Some(503),
                    url: "https://apod.example".into(),
                    message: "unavailable".into(),
                }),
                SourceQuery::Date(date) => Ok(vec![daily_raw(*date, "Stub")]),
                SourceQuery::Latest => Ok(vec![daily_raw(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(), "Latest")]),
                SourceQuery::FullCatalog => Err(AdapterError::Validation("no catalog".into())),
            }
        }
    }

    struct EmptyCatalog;

    #[async_trait]
    impl RemoteSource for EmptyCatalog {
        fn source_id(&self) -> &'static str {
            "stub-catalog"
        }

        fn entity_kind(&self) -> EntityKind {
            EntityKind::LayerCatalog
        }

        async fn fetch(&self, _query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
            Err(AdapterError::Parse("invalid capabilities xml".into()))
        }
    }

    fn driver(daily: Arc<StubDaily>) -> SyncDriver {
        SyncDriver::new(Arc::new(MemoryStore::new()), daily, Arc::new(EmptyCatalog))
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    #[tokio::test]
    async fn backfill_walks_most_recent_first_and_skips_today() {
        let stub = Arc::new(StubDaily::default());
        let driver = driver(stub.clone());
        let report = driver.backfill_from(d(10), 3).await;

        assert_eq!(
            *stub.seen.lock().await,
            vec![SourceQuery::Date(d(9)), SourceQuery::Date(d(8)), SourceQuery::Date(d(7))]
        );
        let keys = report.items.iter().map(|i| i.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2025-03-09", "2025-03-08", "2025-03-07"]);
        assert_eq!((report.success_count(), report.total()), (3, 3));
    }

    #[tokio::test]
    async fn backfill_continues_past_failed_dates() {
        let stub = Arc::new(StubDaily {
            failing: vec![d(8)],
            ..Default::default()
        });
        let driver = driver(stub);
        let report = driver.backfill_from(d(10), 3).await;

        assert_eq!((report.success_count(), report.total()), (2, 3));
        assert!(report.items[1].error.as_deref().unwrap().contains("transport"));

        let log = driver.audit().query(10, None).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "Backfill of 3 days: 2 succeeded, 1 failed");
        assert_eq!(log[0].level, AuditLevel::Warning);
        assert_eq!(log[1].level, AuditLevel::Error);
    }

    #[tokio::test]
    async fn backfill_stops_at_the_earliest_representable_date() {
        let driver = driver(Arc::new(StubDaily::default()));
        let today = NaiveDate::MIN.checked_add_days(Days::new(2)).unwrap();
        let report = driver.backfill_from(today, 5).await;

        assert_eq!(report.total(), 2);
        let log = driver.audit().query(10, None).await.unwrap();
        assert!(log[0].message.starts_with("Backfill of 5 days"));
    }

    #[tokio::test]
    async fn single_date_writes_exactly_one_audit_entry() {
        let stub = Arc::new(StubDaily {
            failing: vec![d(8)],
            ..Default::default()
        });
        let driver = driver(stub);

        assert!(driver.run(SyncMode::SingleDate(d(9))).await.is_success());
        assert!(!driver.run(SyncMode::SingleDate(d(8))).await.is_success());

        let log = driver.audit().query(10, None).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].message.starts_with("Failed to fetch daily image for 2025-03-08"));
        assert!(log[1].message.starts_with("Fetched daily image for 2025-03-09: Stub (created)"));
    }

    #[tokio::test]
    async fn latest_is_keyed_by_the_response_date() {
        let driver = driver(Arc::new(StubDaily::default()));
        let report = driver.run(SyncMode::Latest).await;
        assert_eq!(report.items[0].key, "2025-03-10");
        assert_eq!(report.items[0].outcome, Some(Outcome::Created));
    }

    #[tokio::test]
    async fn catalog_request_failures_get_their_own_entry() {
        let driver = driver(Arc::new(StubDaily::default()));
        let report = driver
            .run(SyncMode::FullCatalog {
                force: false,
                verify_tiles: false,
            })
            .await;
        assert!(!report.is_success());
        assert!(report.items.is_empty());
        let log = driver.audit().query(10, None).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].level, AuditLevel::Error);
        assert!(log[0].message.contains("invalid capabilities xml"));
    }

    #[tokio::test]
    async fn seeding_twice_creates_nothing_new() {
        let driver = driver(Arc::new(StubDaily::default()));
        let first = driver.seed_coordinates().await;
        assert_eq!(first.tally.created, 10);
        let second = driver.seed_coordinates().await;
        assert_eq!(second.tally.created, 0);
        assert_eq!(second.tally.skipped, 10);
        assert_eq!(driver.status().await.unwrap().total_coordinates, 10);
    }
}
