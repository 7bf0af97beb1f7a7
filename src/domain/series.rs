// Aggregated series domain model
use super::error::DomainError;

/// One bucket of an aggregated series
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePoint {
    pub bucket_id: String,
    pub average_value: f64,
}

impl AggregatePoint {
    pub fn new(bucket_id: impl Into<String>, average_value: f64) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            average_value,
        }
    }
}

/// Points ordered by `bucket_id` ascending, at most one point per bucket
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    points: Vec<AggregatePoint>,
}

impl Series {
    pub fn new(mut points: Vec<AggregatePoint>) -> Result<Self, DomainError> {
        points.sort_by(|a, b| a.bucket_id.cmp(&b.bucket_id));

        if let Some(pair) = points.windows(2).find(|w| w[0].bucket_id == w[1].bucket_id) {
            return Err(DomainError::DuplicateBucket(pair[0].bucket_id.clone()));
        }

        Ok(Self { points })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[AggregatePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn into_points(self) -> Vec<AggregatePoint> {
        self.points
    }
}
