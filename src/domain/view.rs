// Materialized view domain model
use super::query_key::QueryKey;
use super::series::Series;

/// What is currently displayed and the query it answers. Replaced whole,
/// never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub key: QueryKey,
    pub series: Series,
}

impl ViewState {
    pub fn new(key: QueryKey, series: Series) -> Self {
        Self { key, series }
    }

    pub fn answers(&self, key: &QueryKey) -> bool {
        &self.key == key
    }
}
