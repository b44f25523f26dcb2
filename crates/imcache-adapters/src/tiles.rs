use std::sync::Arc;

use chrono::NaiveDate;
use imcache_core::{LayerDraft, DATE_FORMAT, DEFAULT_PROJECTION};
use imcache_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AdapterError;

const REST_TILE_BASE: &str = "https://gibs.earthdata.nasa.gov/wmts/epsg4326/best";
const WMTS_KVP_BASE: &str = "https://gibs.earthdata.nasa.gov/wmts/epsg4326/best/wmts.cgi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u32,
    pub row: u32,
    pub col: u32,
}

/// Sample tile requested when checking that a layer actually serves imagery.
pub const PROBE_TILE: TileCoord = TileCoord { z: 2, row: 1, col: 1 };

pub fn tile_matrix_set(projection: &str) -> &'static str {
    if projection == DEFAULT_PROJECTION {
        "250m"
    } else {
        "31.25m"
    }
}

pub fn format_mime(format: &str) -> &'static str {
    match format {
        "png" => "image/png",
        _ => "image/jpeg",
    }
}

pub fn rest_tile_url(
    layer_id: &str,
    date: NaiveDate,
    tile: TileCoord,
    projection: &str,
    format: &str,
) -> String {
    format!(
        "{REST_TILE_BASE}/{layer_id}/default/{date}/{matrix}/{z}/{row}/{col}.{format}",
        date = date.format(DATE_FORMAT),
        matrix = tile_matrix_set(projection),
        z = tile.z,
        row = tile.row,
        col = tile.col,
    )
}

/// KVP `GetTile` request against the WMTS endpoint.
pub fn wmts_get_tile_url(
    layer_id: &str,
    date: NaiveDate,
    tile: TileCoord,
    tile_matrix_set: &str,
    format: &str,
) -> String {
    format!(
        "{WMTS_KVP_BASE}?SERVICE=WMTS&REQUEST=GetTile&VERSION=1.0.0&LAYER={layer_id}\
         &STYLE=default&TILEMATRIXSET={tile_matrix_set}&TILEMATRIX={z}&TILEROW={row}\
         &TILECOL={col}&FORMAT={mime}&TIME={date}",
        z = tile.z,
        row = tile.row,
        col = tile.col,
        mime = format_mime(format),
        date = date.format(DATE_FORMAT),
    )
}

/// HEAD-probes a sample tile to tell live layers from dead catalog entries.
#[derive(Debug, Clone)]
pub struct TileProbe {
    http: Arc<HttpFetcher>,
}

impl TileProbe {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }

    pub async fn is_available(&self, layer: &LayerDraft, date: NaiveDate) -> Result<bool, AdapterError> {
        let url = rest_tile_url(&layer.layer_id, date, PROBE_TILE, &layer.projection, &layer.format);
        let status = self.http.head_status("nasa-gibs-tiles", &url).await?;
        debug!(layer_id = %layer.layer_id, status = status.as_u16(), "tile probe");
        Ok(status.is_success())
    }
}
