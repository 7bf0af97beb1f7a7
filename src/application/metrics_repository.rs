// Repository trait for the metrics backend
use crate::domain::metric_point::MetricPoint;
use crate::domain::query_key::QueryKey;
use crate::domain::series::Series;
use async_trait::async_trait;

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// Full aggregated series for one query, one round trip
    async fn fetch_aggregate(&self, key: &QueryKey) -> anyhow::Result<Series>;

    /// Every metric name the backend knows, in the backend's order
    async fn fetch_metric_names(&self) -> anyhow::Result<Vec<String>>;

    /// Record one raw observation
    async fn log_metric_point(&self, point: &MetricPoint) -> anyhow::Result<()>;
}
