// Domain layer - Core types and rules, no I/O
pub mod catalog;
pub mod error;
pub mod event;
pub mod metric_point;
pub mod query_key;
pub mod series;
pub mod view;
