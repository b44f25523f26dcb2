//! Core domain model for the imagery metadata cache: persisted records,
//! natural keys, canonical drafts and reconciliation vocabulary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Fixed wire format for every date the remote sources and the API exchange.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub const DEFAULT_MEDIA_TYPE: &str = "image";
pub const DEFAULT_PROJECTION: &str = "EPSG:4326";
pub const OTHER_CATEGORY: &str = "Other";

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    DailyImage,
    LayerCatalog,
    NamedCoordinate,
}

impl EntityKind {
    /// How an incoming record treats an already persisted row with the same key.
    pub fn update_policy(self) -> UpdatePolicy {
        match self {
            EntityKind::DailyImage => UpdatePolicy::AlwaysRefresh,
            EntityKind::LayerCatalog => UpdatePolicy::SkipUnlessForced,
            EntityKind::NamedCoordinate => UpdatePolicy::Immutable,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::DailyImage => "daily image",
            EntityKind::LayerCatalog => "layer",
            EntityKind::NamedCoordinate => "named coordinate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Existing rows are fully replaced on every sync, whatever the mode.
    AlwaysRefresh,
    /// Existing rows are left alone unless the caller forces an overwrite.
    SkipUnlessForced,
    /// Rows are only ever created; later syncs never touch them.
    Immutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    #[default]
    SkipExisting,
    ForceOverwrite,
}

impl ReconcileMode {
    pub fn from_force(force: bool) -> Self {
        if force {
            ReconcileMode::ForceOverwrite
        } else {
            ReconcileMode::SkipExisting
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Running counts for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTally {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.skipped
    }

    pub fn total(&self) -> usize {
        self.succeeded() + self.failed
    }
}

/// Business identifier used for uniqueness instead of the surrogate row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NaturalKey {
    Date { date: NaiveDate },
    LayerId { layer_id: String },
    NameBody { name: String, body: String },
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Date { date } => write!(f, "{}", date.format(DATE_FORMAT)),
            NaturalKey::LayerId { layer_id } => f.write_str(layer_id),
            NaturalKey::NameBody { name, body } => write!(f, "{name} ({body})"),
        }
    }
}

/// Persisted picture-of-the-day row; one per calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyImageRecord {
    pub id: i64,
    pub date: NaiveDate,
    pub title: String,
    pub explanation: String,
    pub url: String,
    pub hd_url: Option<String>,
    pub media_type: String,
    pub copyright: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical shape of a daily image as produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyImageDraft {
    pub date: NaiveDate,
    pub title: String,
    pub explanation: String,
    pub url: String,
    pub hd_url: Option<String>,
    pub media_type: String,
    pub copyright: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl DailyImageDraft {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::Date { date: self.date }
    }
}

impl DailyImageRecord {
    pub fn content(&self) -> DailyImageDraft {
        DailyImageDraft {
            date: self.date,
            title: self.title.clone(),
            explanation: self.explanation.clone(),
            url: self.url.clone(),
            hd_url: self.hd_url.clone(),
            media_type: self.media_type.clone(),
            copyright: self.copyright.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemporalResolution {
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "8day")]
    EightDay,
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "static")]
    Static,
}

impl TemporalResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            TemporalResolution::Daily => "daily",
            TemporalResolution::EightDay => "8day",
            TemporalResolution::Monthly => "monthly",
            TemporalResolution::Static => "static",
        }
    }

    /// Maps an ISO-8601 period from a WMTS time dimension (`P1D`, `P8D`, `P1M`).
    pub fn from_iso_period(period: &str) -> Option<Self> {
        match period.trim().to_ascii_uppercase().as_str() {
            "P1D" => Some(TemporalResolution::Daily),
            "P8D" => Some(TemporalResolution::EightDay),
            "P1M" | "P30D" | "P31D" => Some(TemporalResolution::Monthly),
            _ => None,
        }
    }
}

impl fmt::Display for TemporalResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemporalResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(TemporalResolution::Daily),
            "8day" | "8-day" => Ok(TemporalResolution::EightDay),
            "monthly" => Ok(TemporalResolution::Monthly),
            "static" => Ok(TemporalResolution::Static),
            other => Err(format!("unknown temporal resolution {other:?}")),
        }
    }
}

/// Persisted imagery layer; one per layer identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCatalogEntry {
    pub id: i64,
    pub layer_id: String,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub format: String,
    pub projection: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub temporal_resolution: TemporalResolution,
    pub category: String,
    pub tags: Vec<String>,
    pub source: String,
    pub wraparound: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDraft {
    pub layer_id: String,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub format: String,
    pub projection: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub temporal_resolution: TemporalResolution,
    pub category: String,
    pub tags: Vec<String>,
    pub source: String,
    pub wraparound: bool,
}

impl LayerDraft {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::LayerId {
            layer_id: self.layer_id.clone(),
        }
    }
}

impl LayerCatalogEntry {
    pub fn content(&self) -> LayerDraft {
        LayerDraft {
            layer_id: self.layer_id.clone(),
            title: self.title.clone(),
            subtitle: self.subtitle.clone(),
            description: self.description.clone(),
            format: self.format.clone(),
            projection: self.projection.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            temporal_resolution: self.temporal_resolution,
            category: self.category.clone(),
            tags: self.tags.clone(),
            source: self.source.clone(),
            wraparound: self.wraparound,
        }
    }
}

/// Named feature on a body (crater on the Moon, nebula in deep space, ...).
/// Unique per `(name, body)` pair, not globally by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCoordinate {
    pub id: i64,
    pub name: String,
    pub body: String,
    pub kind: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: Option<String>,
    /// Weak reference; the store nulls it when the referenced image is deleted.
    pub daily_image_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateDraft {
    pub name: String,
    pub body: String,
    pub kind: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: Option<String>,
    pub daily_image_id: Option<i64>,
}

impl CoordinateDraft {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::NameBody {
            name: self.name.clone(),
            body: self.body.clone(),
        }
    }
}

/// Normalizer output handed to the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum CanonicalRecord {
    DailyImage(DailyImageDraft),
    Layer(LayerDraft),
    Coordinate(CoordinateDraft),
}

impl CanonicalRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            CanonicalRecord::DailyImage(_) => EntityKind::DailyImage,
            CanonicalRecord::Layer(_) => EntityKind::LayerCatalog,
            CanonicalRecord::Coordinate(_) => EntityKind::NamedCoordinate,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            CanonicalRecord::DailyImage(d) => d.natural_key(),
            CanonicalRecord::Layer(l) => l.natural_key(),
            CanonicalRecord::Coordinate(c) => c.natural_key(),
        }
    }

    /// Short human label for logs and audit messages.
    pub fn label(&self) -> &str {
        match self {
            CanonicalRecord::DailyImage(d) => &d.title,
            CanonicalRecord::Layer(l) => &l.title,
            CanonicalRecord::Coordinate(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Success => "success",
            AuditLevel::Warning => "warning",
            AuditLevel::Error => "error",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditLevel::Info),
            "success" => Ok(AuditLevel::Success),
            "warning" => Ok(AuditLevel::Warning),
            "error" => Ok(AuditLevel::Error),
            other => Err(format!("unknown audit level {other:?}")),
        }
    }
}

/// Append-only run outcome entry. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Per-session map view state for the browser control panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub session_id: String,
    pub active_layers: Vec<String>,
    pub layer_opacity: BTreeMap<String, f64>,
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom_level: i32,
    pub projection: String,
    pub current_date: NaiveDate,
}

impl ViewConfig {
    pub fn new(session_id: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            session_id: session_id.into(),
            active_layers: Vec::new(),
            layer_opacity: BTreeMap::new(),
            center_lat: 0.0,
            center_lon: 0.0,
            zoom_level: 2,
            projection: DEFAULT_PROJECTION.to_string(),
            current_date: today,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    pub fn new(page: Option<usize>, per_page: Option<usize>, default_per_page: usize) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(default_per_page).clamp(1, 500),
        }
    }

    /// Saturates instead of overflowing for absurd page numbers.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        self.total.max(1).div_ceil(self.per_page.max(1))
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }
}

/// Filter for catalog browsing; `query` matches title, description and layer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFilter {
    pub query: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total_images: usize,
    pub latest_date: Option<NaiveDate>,
    pub oldest_date: Option<NaiveDate>,
    pub total_coordinates: usize,
    pub total_layers: usize,
    pub total_audit_entries: usize,
}
