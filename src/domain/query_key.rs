// Query identity - canonical key for one aggregated view
use super::error::DomainError;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;

/// Token standing in for an absent date bound in encoded keys
pub const NO_BOUND: &str = "null";

const SEPARATOR: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Day,
    Hour,
    Minute,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Day => "day",
            Interval::Hour => "hour",
            Interval::Minute => "minute",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Interval::Day),
            "hour" => Ok(Interval::Hour),
            "minute" => Ok(Interval::Minute),
            _ => Err(DomainError::InvalidInterval(s.to_string())),
        }
    }
}

/// The user-visible query parameters other than the metric name.
/// The metric name comes from the catalog selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub interval: Interval,
    pub include_zeros: bool,
}

impl QueryParams {
    pub fn new(interval: Interval, include_zeros: bool) -> Self {
        Self {
            start_date: None,
            end_date: None,
            interval,
            include_zeros,
        }
    }

    pub fn with_range(
        mut self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start_date;
        self.end_date = end_date;
        self
    }
}

/// Identity of one active view. Immutable once built; a parameter change
/// produces a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    metric_name: String,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    interval: Interval,
    include_zeros: bool,
}

impl QueryKey {
    pub fn new(metric_name: impl Into<String>, params: &QueryParams) -> Result<Self, DomainError> {
        if let (Some(start), Some(end)) = (params.start_date, params.end_date) {
            if start > end {
                return Err(DomainError::InvalidRange { start, end });
            }
        }

        Ok(Self {
            metric_name: metric_name.into(),
            start_date: params.start_date,
            end_date: params.end_date,
            interval: params.interval,
            include_zeros: params.include_zeros,
        })
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn include_zeros(&self) -> bool {
        self.include_zeros
    }

    pub fn params(&self) -> QueryParams {
        QueryParams {
            start_date: self.start_date,
            end_date: self.end_date,
            interval: self.interval,
            include_zeros: self.include_zeros,
        }
    }

    /// Whether `timestamp` lies in `[start, end]`; a missing bound is open.
    pub fn covers(&self, timestamp: DateTime<Utc>) -> bool {
        self.start_date.is_none_or(|start| timestamp >= start)
            && self.end_date.is_none_or(|end| timestamp <= end)
    }

    /// Canonical string form: `{name}_{start}_{end}_{interval}_{include_zeros}`.
    ///
    /// Timestamps render as RFC 3339 in UTC and never contain the separator,
    /// so the trailing four fields always split back unambiguously.
    pub fn encode(&self) -> String {
        format!(
            "{name}{sep}{start}{sep}{end}{sep}{interval}{sep}{zeros}",
            name = self.metric_name,
            start = encode_bound(self.start_date),
            end = encode_bound(self.end_date),
            interval = self.interval,
            zeros = self.include_zeros,
            sep = SEPARATOR,
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, DomainError> {
        let malformed = || DomainError::MalformedKey(encoded.to_string());

        let mut fields = encoded.rsplitn(5, SEPARATOR);
        let zeros = fields.next().ok_or_else(malformed)?;
        let interval = fields.next().ok_or_else(malformed)?;
        let end = fields.next().ok_or_else(malformed)?;
        let start = fields.next().ok_or_else(malformed)?;
        let name = fields.next().ok_or_else(malformed)?;

        let include_zeros = zeros.parse::<bool>().map_err(|_| malformed())?;
        let interval = interval.parse::<Interval>().map_err(|_| malformed())?;
        let params = QueryParams {
            start_date: decode_bound(start).ok_or_else(malformed)?,
            end_date: decode_bound(end).ok_or_else(malformed)?,
            interval,
            include_zeros,
        };

        QueryKey::new(name, &params)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub fn encode_bound(bound: Option<DateTime<Utc>>) -> String {
    match bound {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => NO_BOUND.to_string(),
    }
}

// Outer None: unparseable. Inner None: absent bound.
fn decode_bound(raw: &str) -> Option<Option<DateTime<Utc>>> {
    if raw == NO_BOUND {
        return Some(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| Some(ts.with_timezone(&Utc)))
}
