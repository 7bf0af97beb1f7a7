// Validated metric point ready to be logged
use super::error::LogPointError;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
}

impl MetricPoint {
    /// Validate raw user input: the name must be non-blank and the value
    /// a finite number.
    pub fn parse(name: &str, raw_value: &str) -> Result<Self, LogPointError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LogPointError::EmptyName);
        }

        let value = raw_value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| LogPointError::InvalidValue(raw_value.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            value,
        })
    }
}
