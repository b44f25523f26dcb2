use std::sync::Arc;

use async_trait::async_trait;
use imcache_core::EntityKind;
use imcache_storage::HttpFetcher;
use roxmltree::{Document, Node};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{AdapterError, RawRecord, RemoteSource, SourceQuery};

pub const DEFAULT_CAPABILITIES_URL: &str =
    "https://gibs.earthdata.nasa.gov/wmts/epsg4326/best/1.0.0/WMTSCapabilities.xml";

const WMTS_NS: &str = "http://www.opengis.net/wmts/1.0";
const OWS_NS: &str = "http://www.opengis.net/ows/1.1";

const FALLBACK_LAYERS_YAML: &str = include_str!("../data/fallback_layers.yaml");

/// WMTS capabilities document of the Earth imagery tile service.
#[derive(Debug, Clone)]
pub struct GibsCapabilitiesSource {
    http: Arc<HttpFetcher>,
    capabilities_url: String,
    use_fallback: bool,
}

impl GibsCapabilitiesSource {
    pub fn new(http: Arc<HttpFetcher>, capabilities_url: impl Into<String>) -> Self {
        Self {
            http,
            capabilities_url: capabilities_url.into(),
            use_fallback: true,
        }
    }

    /// Disables the curated catalog used when the document lists no layers.
    pub fn without_fallback(mut self) -> Self {
        self.use_fallback = false;
        self
    }
}

#[async_trait]
impl RemoteSource for GibsCapabilitiesSource {
    fn source_id(&self) -> &'static str {
        "nasa-gibs"
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::LayerCatalog
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, AdapterError> {
        if *query != SourceQuery::FullCatalog {
            return Err(AdapterError::Validation(format!(
                "layer catalog only supports full catalog queries, got {query}"
            )));
        }

        let resp = self
            .http
            .fetch_bytes(self.source_id(), &self.capabilities_url, &[])
            .await?;
        let text = std::str::from_utf8(&resp.body)
            .map_err(|e| AdapterError::Parse(format!("capabilities are not utf-8: {e}")))?;
        let layers = parse_capabilities(text)?;
        debug!(layers = layers.len(), "parsed capabilities");

        if layers.is_empty() && self.use_fallback {
            warn!("capabilities listed no layers; using curated fallback catalog");
            return fallback_catalog();
        }
        Ok(layers)
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, ns: &str, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name && c.tag_name().namespace() == Some(ns))
}

fn child_text(node: Node<'_, '_>, ns: &str, name: &str) -> Option<String> {
    child(node, ns, name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

fn time_dimension<'a, 'input>(layer: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
    layer.children().find(|c| {
        c.is_element()
            && c.tag_name().name() == "Dimension"
            && c.tag_name().namespace() == Some(WMTS_NS)
            && child_text(*c, OWS_NS, "Identifier").as_deref() == Some("Time")
    })
}

/// Extracts one raw record per `wmts:Layer`. Layers without an identifier or
/// a title are skipped; the rest of the document still counts.
pub fn parse_capabilities(xml: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let doc = Document::parse(xml)
        .map_err(|e| AdapterError::Parse(format!("invalid capabilities xml: {e}")))?;

    let mut out = Vec::new();
    for layer in doc.descendants().filter(|n| {
        n.is_element() && n.tag_name().name() == "Layer" && n.tag_name().namespace() == Some(WMTS_NS)
    }) {
        let (Some(identifier), Some(title)) = (
            child_text(layer, OWS_NS, "Identifier"),
            child_text(layer, OWS_NS, "Title"),
        ) else {
            debug!("skipping layer without identifier or title");
            continue;
        };

        let mut record = RawRecord::new();
        record.insert("identifier".into(), JsonValue::String(identifier));
        record.insert("title".into(), JsonValue::String(title));
        if let Some(abstract_text) = child_text(layer, OWS_NS, "Abstract") {
            record.insert("abstract".into(), JsonValue::String(abstract_text));
        }
        if let Some(format) = child_text(layer, WMTS_NS, "Format") {
            record.insert("format".into(), JsonValue::String(format));
        }
        if let Some(time) = time_dimension(layer) {
            if let Some(default) = child_text(time, WMTS_NS, "Default") {
                record.insert("time_default".into(), JsonValue::String(default));
            }
            let values = time
                .children()
                .filter(|c| {
                    c.is_element()
                        && c.tag_name().name() == "Value"
                        && c.tag_name().namespace() == Some(WMTS_NS)
                })
                .filter_map(|c| c.text().map(str::trim).map(ToString::to_string))
                .filter(|v| !v.is_empty())
                .map(JsonValue::String)
                .collect::<Vec<_>>();
            if !values.is_empty() {
                record.insert("time_values".into(), JsonValue::Array(values));
            }
        }
        out.push(record);
    }
    Ok(out)
}

pub fn fallback_catalog() -> Result<Vec<RawRecord>, AdapterError> {
    serde_yaml::from_str(FALLBACK_LAYERS_YAML)
        .map_err(|e| AdapterError::Parse(format!("fallback catalog: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Capabilities xmlns="http://www.opengis.net/wmts/1.0"
              xmlns:ows="http://www.opengis.net/ows/1.1" version="1.0.0">
  <Contents>
    <Layer>
      <ows:Title>Fires and Thermal Anomalies (Day and Night)</ows:Title>
      <ows:Abstract>Active fire detections</ows:Abstract>
      <ows:Identifier>MODIS_Terra_Thermal_Anomalies_All</ows:Identifier>
      <Format>image/png</Format>
      <Dimension>
        <ows:Identifier>Time</ows:Identifier>
        <Default>2025-03-09</Default>
        <Value>2000-11-01/2025-03-09/P1D</Value>
      </Dimension>
    </Layer>
    <Layer>
      <ows:Title>No identifier here</ows:Title>
      <Format>image/png</Format>
    </Layer>
    <Layer>
      <ows:Identifier>Untitled_Layer</ows:Identifier>
    </Layer>
    <Layer>
      <ows:Title>Blue Marble: Next Generation</ows:Title>
      <ows:Identifier>BlueMarble_NextGeneration</ows:Identifier>
      <Format>image/jpeg</Format>
    </Layer>
  </Contents>
</Capabilities>"#;

    #[test]
    fn layers_missing_identifier_or_title_are_skipped() {
        let records = parse_capabilities(CAPABILITIES).unwrap();
        let ids = records
            .iter()
            .map(|r| r["identifier"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["MODIS_Terra_Thermal_Anomalies_All", "BlueMarble_NextGeneration"]);
    }

    #[test]
    fn time_dimension_and_format_are_extracted() {
        let records = parse_capabilities(CAPABILITIES).unwrap();
        let fires = &records[0];
        assert_eq!(fires["format"], "image/png");
        assert_eq!(fires["abstract"], "Active fire detections");
        assert_eq!(fires["time_default"], "2025-03-09");
        assert_eq!(fires["time_values"][0], "2000-11-01/2025-03-09/P1D");
        assert!(records[1].get("time_values").is_none());
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(matches!(
            parse_capabilities("<Capabilities><Layer>"),
            Err(AdapterError::Parse(_))
        ));
    }

    #[test]
    fn documents_without_layers_parse_to_nothing() {
        let empty = r#"<Capabilities xmlns="http://www.opengis.net/wmts/1.0"><Contents/></Capabilities>"#;
        assert!(parse_capabilities(empty).unwrap().is_empty());
    }

    #[test]
    fn fallback_catalog_is_well_formed() {
        let records = fallback_catalog().unwrap();
        assert!(records.len() >= 20);
        assert!(records.iter().all(|r| r.contains_key("identifier") && r.contains_key("category")));
        assert_eq!(records[0]["identifier"], "VIIRS_SNPP_CorrectedReflectance_TrueColor");
    }
}
