use thiserror::Error;

use crate::pool::PoolError;

/// Everything that can go wrong between accepting a request and
/// handing back scraped content. All variants surface as the same
/// JSON error envelope; only `MissingUrl` maps to a 400.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("URL is required")]
    MissingUrl,

    #[error("No browsers available - all busy")]
    PoolExhausted,

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Timeout")]
    Timeout,
}

impl From<PoolError> for SolverError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted => SolverError::PoolExhausted,
            PoolError::Launch(msg) => SolverError::Browser(msg),
        }
    }
}
