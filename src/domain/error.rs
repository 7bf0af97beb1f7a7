// Domain errors
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("invalid interval '{0}', supported intervals: minute, hour, day")]
    InvalidInterval(String),

    #[error("start date {start} must be less than or equal to end date {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("malformed query key '{0}'")]
    MalformedKey(String),

    #[error("duplicate bucket '{0}' in series")]
    DuplicateBucket(String),
}

/// Rejection of a metric point before it is sent anywhere
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogPointError {
    #[error("Please enter a metric name.")]
    EmptyName,

    #[error("Please enter a valid number for the metric value.")]
    InvalidValue(String),
}

/// A push payload that matches neither event shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed push event: {reason}")]
pub struct MalformedEvent {
    pub reason: String,
}

impl MalformedEvent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
