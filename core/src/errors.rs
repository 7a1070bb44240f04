use std::fmt;

/// Validation failures for a single metric, matching the Go original's
/// sentinel errors (`MetricValEmptyField`, `MetricValWrongType`,
/// `MetricValValueIsNotFloat`) one for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelError {
    EmptyField,
    WrongType,
    ValueNotFloat,
    BothValueAndDelta,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EmptyField => write!(f, "metric type, name or value is empty"),
            ModelError::WrongType => write!(f, "metric type must be gauge or counter"),
            ModelError::ValueNotFloat => write!(f, "metric value is not a float"),
            ModelError::BothValueAndDelta => write!(f, "metric must not set both value and delta"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Storage-layer failures, reported by both the in-memory and relational
/// backends.
#[derive(Debug)]
pub enum StorageError {
    NotFound,
    WrongType,
    Io(std::io::Error),
    Serde(String),
    Database(String),
    InvalidData(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "no data for requested metric"),
            StorageError::WrongType => write!(f, "unexpected metric type"),
            StorageError::Io(err) => write!(f, "io error: {err}"),
            StorageError::Serde(msg) => write!(f, "serialization error: {msg}"),
            StorageError::Database(msg) => write!(f, "database error: {msg}"),
            StorageError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serde(err.to_string())
    }
}

impl From<ModelError> for StorageError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::WrongType => StorageError::WrongType,
            other => StorageError::InvalidData(other.to_string()),
        }
    }
}
