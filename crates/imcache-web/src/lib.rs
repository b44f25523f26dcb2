//! Axum JSON API and askama control panel over the imagery cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use imcache_adapters::{
    format_mime, rest_tile_url, tile_matrix_set, wmts_get_tile_url, TileCoord, PROBE_TILE,
};
use imcache_core::{parse_date, LayerFilter, PageRequest, ViewConfig, DATE_FORMAT};
use imcache_storage::Store;
use imcache_sync::{resolve_date_keyword, SyncDriver, SyncMode, SyncReport};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const SESSION_HEADER: &str = "x-session-id";
const DEFAULT_PER_PAGE: usize = 30;
const COORDINATE_SEARCH_LIMIT: usize = 10;
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;
const MAX_BACKFILL_DAYS: u32 = 365;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub driver: Arc<SyncDriver>,
}

impl AppState {
    pub fn new(driver: Arc<SyncDriver>) -> Self {
        Self {
            store: driver.store().clone(),
            driver,
        }
    }
}

#[derive(Debug, Clone)]
struct LogRow {
    timestamp: String,
    level: &'static str,
    message: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_images: usize,
    latest_date: String,
    oldest_date: String,
    total_layers: usize,
    total_coordinates: usize,
    total_audit_entries: usize,
    has_latest: bool,
    latest_title: String,
    latest_url: String,
    categories: Vec<String>,
    logs: Vec<LogRow>,
}

#[derive(Debug, Deserialize, Default)]
struct ImagesQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ByDateQuery {
    date: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CoordinatesQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LayersQuery {
    q: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TileQuery {
    date: Option<String>,
    z: Option<u32>,
    row: Option<u32>,
    col: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<usize>,
    since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncDateRequest {
    date: String,
}

#[derive(Debug, Deserialize)]
struct BackfillRequest {
    days: u32,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    verify_tiles: bool,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Deserialize, Default)]
struct ViewConfigUpdate {
    active_layers: Option<Vec<String>>,
    layer_opacity: Option<BTreeMap<String, f64>>,
    center_lat: Option<f64>,
    center_lon: Option<f64>,
    zoom_level: Option<i32>,
    projection: Option<String>,
    current_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/images", get(images_handler))
        .route("/api/images/by-date", get(image_by_date_handler))
        .route("/api/images/{id}", get(image_detail_handler))
        .route("/api/coordinates", get(coordinates_handler))
        .route("/api/layers", get(layers_handler))
        .route("/api/layers/categories", get(layer_categories_handler))
        .route("/api/layers/{layer_id}", get(layer_detail_handler))
        .route("/api/layers/{layer_id}/tile", get(layer_tile_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/status", get(status_handler))
        .route("/api/sync/date", post(sync_date_handler))
        .route("/api/sync/backfill", post(sync_backfill_handler))
        .route("/api/sync/catalog", post(sync_catalog_handler))
        .route("/api/seed/coordinates", post(seed_coordinates_handler))
        .route("/api/config", get(get_config_handler).post(save_config_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web listener bound");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = match state.store.status_summary().await {
        Ok(status) => status,
        Err(err) => return server_error(err),
    };
    let latest = match state.store.list_daily_images(PageRequest::new(Some(1), Some(1), 1)).await {
        Ok(page) => page.items.into_iter().next(),
        Err(err) => return server_error(err),
    };
    let categories = match state.store.layer_categories().await {
        Ok(categories) => categories,
        Err(err) => return server_error(err),
    };
    let logs = match state.driver.audit().query(20, None).await {
        Ok(entries) => entries
            .into_iter()
            .map(|e| LogRow {
                timestamp: e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                level: e.level.as_str(),
                message: e.message,
            })
            .collect(),
        Err(err) => return server_error(err),
    };

    let fmt_date = |d: Option<NaiveDate>| {
        d.map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "n/a".into())
    };
    render_html(IndexTemplate {
        total_images: status.total_images,
        latest_date: fmt_date(status.latest_date),
        oldest_date: fmt_date(status.oldest_date),
        total_layers: status.total_layers,
        total_coordinates: status.total_coordinates,
        total_audit_entries: status.total_audit_entries,
        has_latest: latest.is_some(),
        latest_title: latest.as_ref().map(|i| i.title.clone()).unwrap_or_default(),
        latest_url: latest.map(|i| i.url).unwrap_or_default(),
        categories,
        logs,
    })
}

async fn images_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImagesQuery>,
) -> Response {
    let request = PageRequest::new(query.page, query.per_page, DEFAULT_PER_PAGE);
    match state.store.list_daily_images(request).await {
        Ok(page) => Json(json!({
            "items": page.items,
            "page": page.page,
            "per_page": page.per_page,
            "total": page.total,
            "total_pages": page.total_pages(),
            "has_next": page.has_next(),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn image_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.get_daily_image(id).await {
        Ok(Some(image)) => Json(image).into_response(),
        Ok(None) => not_found(format!("daily image {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn image_by_date_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ByDateQuery>,
) -> Response {
    let Some(raw) = query.date else {
        return bad_request("date parameter is required");
    };
    let Some(date) = parse_date(&raw) else {
        return bad_request(format!("invalid date {raw:?}, expected YYYY-MM-DD"));
    };
    match state.store.find_daily_image_by_date(date).await {
        Ok(Some(image)) => Json(image).into_response(),
        Ok(None) => not_found(format!("no daily image for {raw}")),
        Err(err) => server_error(err),
    }
}

async fn coordinates_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CoordinatesQuery>,
) -> Response {
    let q = query.q.unwrap_or_default();
    match state
        .store
        .search_coordinates(q.trim(), COORDINATE_SEARCH_LIMIT)
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn layers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LayersQuery>,
) -> Response {
    let filter = LayerFilter {
        query: query.q.filter(|q| !q.trim().is_empty()),
        category: query
            .category
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("all")),
        limit: query.limit,
    };
    match state.store.search_layers(&filter).await {
        Ok(found) => Json(json!({
            "layers": found.layers,
            "total": found.total,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn layer_categories_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.layer_categories().await {
        Ok(categories) => Json(categories).into_response(),
        Err(err) => server_error(err),
    }
}

async fn layer_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(layer_id): Path<String>,
) -> Response {
    match state.store.find_layer(&layer_id).await {
        Ok(Some(layer)) => Json(layer).into_response(),
        Ok(None) => not_found(format!("layer {layer_id} not found")),
        Err(err) => server_error(err),
    }
}

async fn layer_tile_handler(
    State(state): State<Arc<AppState>>,
    Path(layer_id): Path<String>,
    Query(query): Query<TileQuery>,
) -> Response {
    let layer = match state.store.find_layer(&layer_id).await {
        Ok(Some(layer)) => layer,
        Ok(None) => return not_found(format!("layer {layer_id} not found")),
        Err(err) => return server_error(err),
    };
    let today = Utc::now().date_naive();
    let date = match query.date.as_deref() {
        Some(raw) => match resolve_date_keyword(raw, today) {
            Some(date) => date,
            None => return bad_request(format!("invalid date {raw:?}, expected YYYY-MM-DD")),
        },
        None => today.pred_opt().unwrap_or(today),
    };
    let tile = TileCoord {
        z: query.z.unwrap_or(PROBE_TILE.z),
        row: query.row.unwrap_or(PROBE_TILE.row),
        col: query.col.unwrap_or(PROBE_TILE.col),
    };
    let matrix_set = tile_matrix_set(&layer.projection);

    Json(json!({
        "layer_id": layer.layer_id,
        "date": date.format(DATE_FORMAT).to_string(),
        "tile": tile,
        "tile_matrix_set": matrix_set,
        "mime": format_mime(&layer.format),
        "rest_url": rest_tile_url(&layer.layer_id, date, tile, &layer.projection, &layer.format),
        "wmts_url": wmts_get_tile_url(&layer.layer_id, date, tile, matrix_set, &layer.format),
    }))
    .into_response()
}

fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    parse_date(raw)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let since = match query.since.as_deref() {
        Some(raw) => match parse_since(raw) {
            Some(ts) => Some(ts),
            None => return bad_request(format!("invalid since {raw:?}")),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.driver.audit().query(limit, since).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.driver.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

fn report_response(message: String, report: &SyncReport) -> Response {
    Json(json!({
        "success": report.is_success(),
        "message": message,
        "success_count": report.success_count(),
        "total": report.total(),
        "report": report,
    }))
    .into_response()
}

async fn sync_date_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncDateRequest>,
) -> Response {
    let Some(date) = resolve_date_keyword(&req.date, Utc::now().date_naive()) else {
        return bad_request(format!("invalid date {:?}, expected YYYY-MM-DD or yesterday", req.date));
    };
    let report = state.driver.run(SyncMode::SingleDate(date)).await;
    let message = if report.is_success() {
        format!("Fetched daily image for {}", date.format(DATE_FORMAT))
    } else {
        format!("Failed to fetch daily image for {}", date.format(DATE_FORMAT))
    };
    report_response(message, &report)
}

async fn sync_backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackfillRequest>,
) -> Response {
    if req.days == 0 || req.days > MAX_BACKFILL_DAYS {
        return bad_request(format!("days must be between 1 and {MAX_BACKFILL_DAYS}"));
    }
    let report = state.driver.run(SyncMode::Backfill(req.days)).await;
    let message = format!(
        "Backfilled {} of {} days",
        report.success_count(),
        report.total()
    );
    report_response(message, &report)
}

async fn sync_catalog_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CatalogRequest>,
) -> Response {
    let report = state
        .driver
        .run(SyncMode::FullCatalog {
            force: req.force,
            verify_tiles: req.verify_tiles,
        })
        .await;
    let message = match &report.error {
        Some(err) => format!("Layer catalog sync failed: {err}"),
        None => format!(
            "Layer catalog sync: created {}, updated {}, skipped {}, failed {}",
            report.tally.created, report.tally.updated, report.tally.skipped, report.tally.failed
        ),
    };
    report_response(message, &report)
}

async fn seed_coordinates_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.driver.seed_coordinates().await;
    let message = format!("Created {} coordinates", report.tally.created);
    report_response(message, &report)
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

async fn load_or_default_config(store: &dyn Store, session: &str) -> Result<ViewConfig, Response> {
    match store.load_view_config(session).await {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(ViewConfig::new(session, Utc::now().date_naive())),
        Err(err) => Err(server_error(err)),
    }
}

async fn get_config_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session) = session_id(&headers) else {
        return bad_request(format!("missing {SESSION_HEADER} header"));
    };
    match load_or_default_config(state.store.as_ref(), &session).await {
        Ok(config) => Json(config).into_response(),
        Err(resp) => resp,
    }
}

fn apply_update(config: &mut ViewConfig, update: ViewConfigUpdate) -> Result<(), String> {
    if let Some(lat) = update.center_lat {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(format!("center_lat {lat} out of range"));
        }
        config.center_lat = lat;
    }
    if let Some(lon) = update.center_lon {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(format!("center_lon {lon} out of range"));
        }
        config.center_lon = lon;
    }
    if let Some(opacity) = update.layer_opacity {
        if let Some((layer, value)) = opacity.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
            return Err(format!("opacity {value} for {layer} out of range"));
        }
        config.layer_opacity = opacity;
    }
    if let Some(raw) = update.current_date {
        config.current_date =
            parse_date(&raw).ok_or_else(|| format!("invalid current_date {raw:?}"))?;
    }
    if let Some(layers) = update.active_layers {
        config.active_layers = layers;
    }
    if let Some(zoom) = update.zoom_level {
        config.zoom_level = zoom;
    }
    if let Some(projection) = update.projection {
        config.projection = projection;
    }
    Ok(())
}

async fn save_config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<ViewConfigUpdate>,
) -> Response {
    let Some(session) = session_id(&headers) else {
        return bad_request(format!("missing {SESSION_HEADER} header"));
    };
    let mut config = match load_or_default_config(state.store.as_ref(), &session).await {
        Ok(config) => config,
        Err(resp) => return resp,
    };
    if let Err(msg) = apply_update(&mut config, update) {
        return bad_request(msg);
    }
    match state.store.save_view_config(&config, Utc::now()).await {
        Ok(()) => Json(config).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, message.into())
}

fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, message.into())
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(%err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
}
