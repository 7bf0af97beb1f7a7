// Mappers between domain models and the JSON wire formats
use crate::application::push_channel::PushFrame;
use crate::domain::catalog::CatalogSnapshot;
use crate::domain::error::{DomainError, MalformedEvent};
use crate::domain::event::PushEvent;
use crate::domain::query_key::{encode_bound, QueryKey};
use crate::domain::series::{AggregatePoint, Series};
use crate::domain::view::ViewState;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate request body, also used as stream query parameters
/// (absent bounds are sent as `null` in JSON and omitted from query strings)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsRequest {
    pub name: String,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    pub interval: String,
    pub include_zeros: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatePointDto {
    #[serde(rename = "_id")]
    pub bucket_id: String,
    pub average_value: f64,
}

#[derive(Debug, Deserialize)]
pub struct MetricsResponse {
    pub metrics: Vec<AggregatePointDto>,
}

#[derive(Debug, Serialize)]
pub struct LogMetricRequest<'a> {
    pub name: &'a str,
    pub value: f64,
}

/// Both push shapes flattened; which fields are present decides the shape.
#[derive(Debug, Default, Deserialize)]
struct RawPushEvent {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    metrics: Option<Vec<AggregatePointDto>>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ViewDto {
    pub key: String,
    pub metric: String,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    pub interval: String,
    pub include_zeros: bool,
    pub metrics: Vec<AggregatePointDto>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CatalogDto {
    pub names: Vec<String>,
    pub selected: String,
}

pub fn metrics_request(key: &QueryKey) -> MetricsRequest {
    MetricsRequest {
        name: key.metric_name().to_string(),
        start_date: key.start_date().map(|d| encode_bound(Some(d))),
        end_date: key.end_date().map(|d| encode_bound(Some(d))),
        interval: key.interval().to_string(),
        include_zeros: key.include_zeros(),
    }
}

pub fn series_from_wire(points: Vec<AggregatePointDto>) -> Result<Series, DomainError> {
    Series::new(
        points
            .into_iter()
            .map(|p| AggregatePoint::new(p.bucket_id, p.average_value))
            .collect(),
    )
}

fn series_to_wire(series: &Series) -> Vec<AggregatePointDto> {
    series
        .points()
        .iter()
        .map(|p| AggregatePointDto {
            bucket_id: p.bucket_id.clone(),
            average_value: p.average_value,
        })
        .collect()
}

pub fn view_to_wire(view: &ViewState) -> ViewDto {
    let key = &view.key;
    ViewDto {
        key: key.encode(),
        metric: key.metric_name().to_string(),
        start_date: key.start_date().map(|d| encode_bound(Some(d))),
        end_date: key.end_date().map(|d| encode_bound(Some(d))),
        interval: key.interval().to_string(),
        include_zeros: key.include_zeros(),
        metrics: series_to_wire(&view.series),
    }
}

pub fn catalog_to_wire(snapshot: CatalogSnapshot) -> CatalogDto {
    CatalogDto {
        names: snapshot.names,
        selected: snapshot.selected,
    }
}

/// Classify one decoded push payload by which fields it carries.
pub fn decode_push_event(value: serde_json::Value) -> PushFrame {
    let raw: RawPushEvent = serde_json::from_value(value)
        .map_err(|e| MalformedEvent::new(format!("unexpected field types: {}", e)))?;

    if let Some(metrics) = raw.metrics {
        let key = raw
            .key
            .ok_or_else(|| MalformedEvent::new("snapshot without key"))?;
        let metrics = series_from_wire(metrics).map_err(|e| MalformedEvent::new(e.to_string()))?;
        return Ok(PushEvent::SnapshotUpdate { key, metrics });
    }

    match (raw.name, raw.value, raw.timestamp) {
        (Some(name), Some(value), Some(timestamp)) => {
            let timestamp = parse_timestamp(&timestamp)
                .ok_or_else(|| MalformedEvent::new(format!("invalid timestamp '{}'", timestamp)))?;
            Ok(PushEvent::PointAppended {
                name,
                value,
                timestamp,
            })
        }
        _ => Err(MalformedEvent::new(
            "neither metrics nor name, value and timestamp present",
        )),
    }
}

/// RFC 3339, or an offset-less ISO timestamp taken as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
