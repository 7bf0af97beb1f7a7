// Push events delivered over the live channel
use super::series::Series;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A fully recomputed series for the query whose encoded key is `key`
    SnapshotUpdate { key: String, metrics: Series },
    /// One freshly logged, not yet aggregated observation
    PointAppended {
        name: String,
        value: f64,
        timestamp: DateTime<Utc>,
    },
}

impl PushEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::SnapshotUpdate { .. } => "snapshot_update",
            PushEvent::PointAppended { .. } => "point_appended",
        }
    }
}
