//! Error types shared by the search, download and geometry modules

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamlineError {
    #[error("Could not load: {}", path.display())]
    CsvNotFound {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("CSV file {} has no 'id' column", path.display())]
    MissingIdColumn { path: PathBuf },
    #[error("Invalid experiment id: '{0}'")]
    InvalidId(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Malformed streamline data: {0}")]
    MalformedData(String),
    #[error("Connectivity search failed: {0}")]
    Search(String),
    #[error("Unknown color: '{0}'")]
    UnknownColor(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, StreamlineError>;
