//! Raw field maps to canonical drafts. Every failure here is scoped to the
//! one record being shaped.

use chrono::NaiveDate;
use imcache_core::{
    parse_date, CanonicalRecord, CoordinateDraft, DailyImageDraft, EntityKind, LayerDraft,
    TemporalResolution, DEFAULT_MEDIA_TYPE, DEFAULT_PROJECTION,
};
use serde_json::Value as JsonValue;

use crate::categorize::categorize;
use crate::{AdapterError, RawRecord};

pub const LAYER_SOURCE_LABEL: &str = "NASA GIBS";

pub fn normalize(raw: &RawRecord, kind: EntityKind) -> Result<CanonicalRecord, AdapterError> {
    match kind {
        EntityKind::DailyImage => normalize_daily_image(raw).map(CanonicalRecord::DailyImage),
        EntityKind::LayerCatalog => normalize_layer(raw).map(CanonicalRecord::Layer),
        EntityKind::NamedCoordinate => normalize_coordinate(raw).map(CanonicalRecord::Coordinate),
    }
}

/// First non-blank string among `keys`, trimmed.
fn text(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn required_text(raw: &RawRecord, keys: &[&str], what: &str) -> Result<String, AdapterError> {
    text(raw, keys).ok_or_else(|| AdapterError::Validation(format!("missing required field {what}")))
}

fn number(raw: &RawRecord, key: &str) -> Option<f64> {
    match raw.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn date_field(value: &str, what: &str) -> Result<NaiveDate, AdapterError> {
    // Time dimension bounds may carry a time part ("2000-02-24T00:00:00Z").
    parse_date(value)
        .or_else(|| value.get(..10).and_then(parse_date))
        .ok_or_else(|| AdapterError::Validation(format!("unparseable {what} {value:?}")))
}

pub fn normalize_daily_image(raw: &RawRecord) -> Result<DailyImageDraft, AdapterError> {
    let date_text = required_text(raw, &["date"], "date")?;
    let date = parse_date(&date_text)
        .ok_or_else(|| AdapterError::Validation(format!("unparseable date {date_text:?}")))?;

    Ok(DailyImageDraft {
        date,
        title: required_text(raw, &["title"], "title")?,
        explanation: text(raw, &["explanation"]).unwrap_or_default(),
        url: required_text(raw, &["url"], "url")?,
        hd_url: text(raw, &["hdurl", "hd_url"]),
        media_type: text(raw, &["media_type"]).unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()),
        copyright: text(raw, &["copyright"]),
        thumbnail_url: text(raw, &["thumbnail_url"]),
    })
}

/// `image/png` and friends collapse to the short extension used in tile URLs.
pub fn normalize_format(format: &str) -> String {
    let lowered = format.trim().to_ascii_lowercase();
    let short = lowered.strip_prefix("image/").unwrap_or(&lowered);
    match short {
        "jpeg" | "jpg" => "jpg".to_string(),
        "" => "jpg".to_string(),
        other => other.to_string(),
    }
}

struct TimeExtent {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    resolution: Option<TemporalResolution>,
}

/// Reads `start/end/period` interval strings; the first interval supplies the
/// start and period, the last one the end.
fn time_extent(raw: &RawRecord) -> Result<Option<TimeExtent>, AdapterError> {
    let Some(values) = raw.get("time_values").and_then(JsonValue::as_array) else {
        return Ok(None);
    };
    let intervals = values.iter().filter_map(JsonValue::as_str).collect::<Vec<_>>();
    let (Some(first), Some(last)) = (intervals.first(), intervals.last()) else {
        return Ok(None);
    };

    let first_parts = first.split('/').collect::<Vec<_>>();
    let last_parts = last.split('/').collect::<Vec<_>>();
    let start = first_parts
        .first()
        .map(|s| date_field(s, "time dimension start"))
        .transpose()?;
    let end = match last_parts.as_slice() {
        [_, end, ..] => Some(date_field(end, "time dimension end")?),
        [single] => Some(date_field(single, "time dimension value")?),
        [] => None,
    };
    let resolution = first_parts
        .get(2)
        .and_then(|p| TemporalResolution::from_iso_period(p));
    Ok(Some(TimeExtent {
        start,
        end,
        resolution,
    }))
}

pub fn normalize_layer(raw: &RawRecord) -> Result<LayerDraft, AdapterError> {
    let layer_id = required_text(raw, &["identifier", "layer_id", "id"], "identifier")?;
    let title = text(raw, &["title"]).unwrap_or_else(|| layer_id.clone());
    let category = text(raw, &["category", "group"])
        .unwrap_or_else(|| categorize(&layer_id).to_string());

    let extent = time_extent(raw)?;
    let explicit_start = text(raw, &["start_date"])
        .map(|s| date_field(&s, "start_date"))
        .transpose()?;
    let explicit_end = text(raw, &["end_date"])
        .map(|s| date_field(&s, "end_date"))
        .transpose()?;
    let explicit_period = text(raw, &["period", "temporal_resolution"])
        .map(|p| {
            p.parse::<TemporalResolution>()
                .or_else(|e| TemporalResolution::from_iso_period(&p).ok_or(e))
                .map_err(AdapterError::Validation)
        })
        .transpose()?;
    // Unparseable defaults ("current" and the like) are ignored.
    let default_time =
        text(raw, &["time_default"]).and_then(|d| date_field(&d, "time default").ok());

    let temporal_resolution = explicit_period
        .or(extent.as_ref().and_then(|e| e.resolution))
        .unwrap_or(if extent.is_some() || default_time.is_some() {
            TemporalResolution::Daily
        } else {
            TemporalResolution::Static
        });
    let tags = vec![category.to_lowercase()];

    Ok(LayerDraft {
        title,
        subtitle: text(raw, &["subtitle"]).unwrap_or_default(),
        description: text(raw, &["abstract", "description"]).unwrap_or_default(),
        format: normalize_format(&text(raw, &["format"]).unwrap_or_default()),
        projection: text(raw, &["projection"]).unwrap_or_else(|| DEFAULT_PROJECTION.to_string()),
        start_date: explicit_start.or(extent.as_ref().and_then(|e| e.start)),
        end_date: explicit_end
            .or(extent.as_ref().and_then(|e| e.end))
            .or(default_time),
        temporal_resolution,
        tags,
        category,
        source: text(raw, &["source"]).unwrap_or_else(|| LAYER_SOURCE_LABEL.to_string()),
        wraparound: raw
            .get("wraparound")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true),
        layer_id,
    })
}

pub fn normalize_coordinate(raw: &RawRecord) -> Result<CoordinateDraft, AdapterError> {
    let name = required_text(raw, &["name"], "name")?;
    let body = required_text(raw, &["body"], "body")?;
    let kind = text(raw, &["type", "kind"]).unwrap_or_else(|| "other".to_string());
    let latitude = number(raw, "latitude")
        .ok_or_else(|| AdapterError::Validation(format!("{name}: missing latitude")))?;
    let longitude = number(raw, "longitude")
        .ok_or_else(|| AdapterError::Validation(format!("{name}: missing longitude")))?;
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(AdapterError::Validation(format!(
            "{name}: latitude {latitude} out of range"
        )));
    }

    Ok(CoordinateDraft {
        name,
        body,
        kind,
        latitude,
        longitude,
        description: text(raw, &["description"]),
        daily_image_id: raw.get("daily_image_id").and_then(JsonValue::as_i64),
    })
}
