//! Error types for the optimizer and backtester.

use thiserror::Error;

/// Main error type for portfolio optimization and backtesting.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("No instruments are left after filtering. Can't perform portfolio optimization.")]
    FilterExhausted,

    #[error("Only {remaining} instrument(s) left after filtering, at least 2 are needed to optimize")]
    InsufficientUniverse { remaining: usize },

    #[error("Invalid optimizer parameter: {0}")]
    InvalidOptimizerParameter(String),

    #[error("Solver failure: {0}")]
    SolverFailure(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),
}

/// Result type alias for optimizer operations.
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Short remediation hints shown by the command line interface.
pub trait ErrorHelp {
    /// A one-line suggestion for fixing the error, if there is one.
    fn help(&self) -> Option<&'static str>;
}

impl ErrorHelp for OptimizerError {
    fn help(&self) -> Option<&'static str> {
        match self {
            OptimizerError::FilterExhausted => {
                Some("relax the category filters or lower minimumDaysWithData")
            }
            OptimizerError::InsufficientUniverse { .. } => {
                Some("widen the filters so that at least two instruments remain")
            }
            OptimizerError::InvalidOptimizerParameter(_) => {
                Some("targeted optimizers need targetVolatility or targetReturn")
            }
            OptimizerError::SolverFailure(_) => {
                Some("check the price history for gaps or try a different optimizer")
            }
            OptimizerError::DateParseError(_) => Some("dates must use the YYYY-MM-DD format"),
            _ => None,
        }
    }
}
