//! Remote source contracts, the two NASA source implementations and the
//! record normalizer that shapes their raw field maps into canonical drafts.

use async_trait::async_trait;
use chrono::NaiveDate;
use imcache_core::{EntityKind, DATE_FORMAT};
use imcache_storage::FetchError;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

mod apod;
mod categorize;
mod gibs;
mod normalize;
mod tiles;

pub use apod::{parse_apod_body, ApodSource, APOD_SOURCE_ID, DEFAULT_APOD_URL};
pub use categorize::{categorize, KEYWORD_CATEGORIES, KNOWN_LAYER_GROUPS};
pub use gibs::{
    fallback_catalog, parse_capabilities, GibsCapabilitiesSource, DEFAULT_CAPABILITIES_URL,
};
pub use normalize::{
    normalize, normalize_coordinate, normalize_daily_image, normalize_format, normalize_layer,
    LAYER_SOURCE_LABEL,
};
pub use tiles::{
    format_mime, rest_tile_url, tile_matrix_set, wmts_get_tile_url, TileCoord, TileProbe,
    PROBE_TILE,
};

/// Source-native field map, one per remote item, before normalization.
pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceQuery {
    Date(NaiveDate),
    /// Whatever the source currently publishes as its newest item.
    Latest,
    FullCatalog,
}

impl std::fmt::Display for SourceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceQuery::Date(date) => write!(f, "date {}", date.format(DATE_FORMAT)),
            SourceQuery::Latest => f.write_str("latest"),
            SourceQuery::FullCatalog => f.write_str("full catalog"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Non-2xx status, timeout or connection failure. Never retried here.
    #[error("transport error for {url}: {message}")]
    Transport {
        status: Option<u16>,
        url: String,
        message: String,
    },
    #[error("parse error: {0}")]
    Parse(String),
    /// A single record is missing a required field or carries a bad date.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        let status = err.status();
        let url = match &err {
            FetchError::Request { url, .. } | FetchError::HttpStatus { url, .. } => url.clone(),
            FetchError::Closed => String::new(),
        };
        let message = if err.is_timeout() {
            format!("timed out: {err}")
        } else {
            err.to_string()
        };
        AdapterError::Transport {
            status,
            url,
            message,
        }
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Entity kind every record from this source normalizes into.
    fn entity_kind(&self) -> EntityKind;

    /// One network round trip; no persistence and no retries.
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError>;
}
