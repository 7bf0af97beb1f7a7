use crate::application::synchronizer::SynchronizerOptions;
use crate::domain::query_key::{Interval, QueryParams};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    pub backend: BackendSettings,
    pub sync: SyncSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub compressed_frames: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    pub default_metric: String,
    pub default_interval: String,
    pub include_zeros: bool,
    pub queue_capacity: usize,
    pub resubscribe_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub bind_address: String,
}

impl SyncSettings {
    pub fn to_options(&self) -> anyhow::Result<SynchronizerOptions> {
        let interval: Interval = self.default_interval.parse()?;
        Ok(SynchronizerOptions {
            initial_metric: self.default_metric.clone(),
            initial_params: QueryParams::new(interval, self.include_zeros),
            queue_capacity: self.queue_capacity,
            resubscribe_delay: Duration::from_millis(self.resubscribe_delay_ms),
        })
    }
}

pub fn load_sync_config() -> anyhow::Result<SyncConfig> {
    load_sync_config_from("config/sync")
}

/// Load `path` (extension optional) over built-in defaults, then apply
/// `METRICS_SYNC__SECTION__KEY` environment overrides.
pub fn load_sync_config_from(path: &str) -> anyhow::Result<SyncConfig> {
    let settings = config::Config::builder()
        .set_default("backend.base_url", "http://localhost:5000")?
        .set_default("backend.compressed_frames", false)?
        .set_default("sync.default_metric", "metric_example")?
        .set_default("sync.default_interval", "hour")?
        .set_default("sync.include_zeros", false)?
        .set_default("sync.queue_capacity", 100)?
        .set_default("sync.resubscribe_delay_ms", 2000)?
        .set_default("server.bind_address", "0.0.0.0:8080")?
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("METRICS_SYNC").separator("__"))
        .build()?;

    let config: SyncConfig = settings.try_deserialize()?;
    config.sync.to_options()?;
    Ok(config)
}
