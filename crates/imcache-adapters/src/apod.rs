use std::sync::Arc;

use async_trait::async_trait;
use imcache_core::{EntityKind, DATE_FORMAT};
use imcache_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{AdapterError, RawRecord, RemoteSource, SourceQuery};

pub const DEFAULT_APOD_URL: &str = "https://api.nasa.gov/planetary/apod";
pub const APOD_SOURCE_ID: &str = "nasa-apod";

/// Astronomy picture-of-the-day JSON endpoint.
#[derive(Debug, Clone)]
pub struct ApodSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
    api_key: String,
}

impl ApodSource {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl RemoteSource for ApodSource {
    fn source_id(&self) -> &'static str {
        APOD_SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::DailyImage
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
        let mut params = vec![("api_key", self.api_key.clone())];
        match query {
            SourceQuery::Date(date) => params.push(("date", date.format(DATE_FORMAT).to_string())),
            SourceQuery::Latest => {}
            SourceQuery::FullCatalog => {
                return Err(AdapterError::Validation(
                    "picture-of-the-day feed has no catalog dump".into(),
                ))
            }
        }
        params.push(("thumbs", "true".into()));

        let resp = self
            .http
            .fetch_bytes(self.source_id(), &self.endpoint, &params)
            .await?;
        debug!(bytes = resp.body.len(), %query, "apod response");
        parse_apod_body(&resp.body)
    }
}

/// Accepts a single JSON object or an array of them (range queries).
pub fn parse_apod_body(body: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Parse(format!("apod body is not json: {e}")))?;
    match value {
        JsonValue::Object(map) => Ok(vec![map]),
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(map) => Ok(map),
                other => Err(AdapterError::Parse(format!(
                    "expected apod object, found {other}"
                ))),
            })
            .collect(),
        other => Err(AdapterError::Parse(format!(
            "expected apod object, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_bodies_yield_one_record() {
        let body = br#"{"date":"2025-03-09","title":"Tycho","url":"https://apod.example/t.jpg"}"#;
        let records = parse_apod_body(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["title"], "Tycho");
    }

    #[test]
    fn array_bodies_keep_source_order() {
        let body = br#"[{"date":"2025-03-08"},{"date":"2025-03-09"}]"#;
        let records = parse_apod_body(body).unwrap();
        assert_eq!(records[1]["date"], "2025-03-09");
    }

    #[test]
    fn malformed_bodies_are_parse_errors() {
        assert!(matches!(
            parse_apod_body(b"<html>rate limited</html>"),
            Err(AdapterError::Parse(_))
        ));
        assert!(matches!(parse_apod_body(b"42"), Err(AdapterError::Parse(_))));
    }
}
