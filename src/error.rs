use thiserror::Error;

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for DashboardError {
    fn from(err: polars::error::PolarsError) -> Self {
        DashboardError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
