use std::path::PathBuf;

use thiserror::Error;

use crate::models::domain::Direction;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures talking to the flow-log warehouse.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected query response: {0}")]
    Protocol(String),

    #[error("query result has no column named {0}")]
    MissingField(&'static str),

    #[error("column {field} holds invalid value {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("BIGQUERY_ACCESS_TOKEN is not set")]
    MissingToken,
}

/// Failures writing metric documents.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index {index} rejected document ({status}): {body}")]
    Rejected {
        index: String,
        status: u16,
        body: String,
    },

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("encoding document: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("querying flows {}: {source}", .direction.describe())]
    Source {
        direction: Direction,
        #[source]
        source: SourceError,
    },

    #[error("publishing flows {}: {source}", .direction.describe())]
    Sink {
        direction: Direction,
        #[source]
        source: SinkError,
    },
}
