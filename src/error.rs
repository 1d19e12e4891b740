use crate::types::Timestamp;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer length must be positive")]
    ZeroBufferLength,
    #[error("interval must not be negative, got {interval}")]
    NegativeInterval { interval: i64 },
    #[error("a field with the name `{name}` already exists")]
    DuplicateField { name: String },
    #[error("hidden field `{name}` cannot be cumulative")]
    HiddenCumulative { name: String },
    #[error("invalid sampler options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("offset must not be positive, got {offset}")]
    PositiveOffset { offset: i64 },
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("event carries no numeric `{key}` field and no explicit time was given")]
    MissingTime { key: String },
    #[error("expression `{name}` failed: {source}")]
    Expression {
        name: String,
        #[source]
        source: QueryError,
    },
    #[error("time {time} is outside the representable bucket range")]
    TimeOutOfRange { time: Timestamp },
    #[error("periodic sampling requires a running tokio runtime")]
    NoRuntime,
}
