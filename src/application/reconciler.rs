// Event reconciler - classifies push events against the active query
use crate::domain::catalog::MetricCatalog;
use crate::domain::event::PushEvent;
use crate::domain::query_key::QueryKey;
use crate::domain::series::Series;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Snapshot for the active query: show it as-is
    ReplaceView(Series),
    /// Raw point inside the visible window of the selected metric
    Requery,
    /// Raw point that cannot affect the visible series, but may name a
    /// metric the catalog has not seen yet
    RefreshCatalog,
    /// Snapshot answering a query that is no longer active
    Ignore,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ReplaceView(_) => "replace_view",
            Action::Requery => "requery",
            Action::RefreshCatalog => "refresh_catalog",
            Action::Ignore => "ignore",
        }
    }
}

/// Decide how to react to `event`. Pure and synchronous.
pub fn reconcile(event: PushEvent, active: &QueryKey, catalog: &MetricCatalog) -> Action {
    match event {
        PushEvent::SnapshotUpdate { key, metrics } => {
            if key == active.encode() {
                Action::ReplaceView(metrics)
            } else {
                Action::Ignore
            }
        }
        PushEvent::PointAppended {
            name, timestamp, ..
        } => {
            if name == catalog.selected() && active.covers(timestamp) {
                Action::Requery
            } else {
                Action::RefreshCatalog
            }
        }
    }
}
