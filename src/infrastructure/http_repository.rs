// HTTP metrics backend implementation
use crate::application::metrics_repository::MetricsRepository;
use crate::domain::metric_point::MetricPoint;
use crate::domain::query_key::QueryKey;
use crate::domain::series::Series;
use crate::infrastructure::wire::{self, LogMetricRequest, MetricsResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct HttpMetricsRepository {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpMetricsRepository {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/metrics/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to metrics backend", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} request failed with status {}: {}", what, status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl MetricsRepository for HttpMetricsRepository {
    async fn fetch_aggregate(&self, key: &QueryKey) -> Result<Series> {
        let body = wire::metrics_request(key);
        tracing::debug!(key = %key, "Requesting aggregate");

        let response = self
            .send(self.client.post(self.url("get_metrics")).json(&body), "get_metrics")
            .await?;
        let data = response
            .json::<MetricsResponse>()
            .await
            .context("Failed to parse aggregate response")?;

        let series = wire::series_from_wire(data.metrics).context("Backend returned an invalid series")?;
        Ok(series)
    }

    async fn fetch_metric_names(&self) -> Result<Vec<String>> {
        let response = self
            .send(self.client.get(self.url("get_metric_names")), "get_metric_names")
            .await?;

        response
            .json::<Vec<String>>()
            .await
            .context("Failed to parse metric names")
    }

    async fn log_metric_point(&self, point: &MetricPoint) -> Result<()> {
        let body = LogMetricRequest {
            name: &point.name,
            value: point.value,
        };

        self.send(self.client.post(self.url("log_metrics")).json(&body), "log_metrics")
            .await?;
        Ok(())
    }
}
