use std::fmt;
use thiserror::Error;

/// A logical field that could not be resolved against a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.field, self.reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("table '{table}': cannot resolve required field(s): {}", join_missing(.missing))]
    Schema {
        table: String,
        missing: Vec<MissingField>,
    },

    #[error("table '{table}': no rows left after date filtering, nothing to rank against")]
    EmptyPrimary { table: String },

    #[error("unknown grouping dimension '{dim}' (available: {available:?})")]
    UnknownDimension { dim: String, available: Vec<String> },

    #[error("snapshots are not comparable: before has dimensions {before:?}, after has {after:?}")]
    IncompatibleSnapshots {
        before: Vec<String>,
        after: Vec<String>,
    },

    #[error(
        "snapshot has several '{dim}' periods for '{entity}' ({periods:?}); compare one period per window"
    )]
    MultiPeriodSnapshot {
        dim: String,
        entity: String,
        periods: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn join_missing(missing: &[MissingField]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
