//! Environment errors.

use cloudpool_id::PoolId;
use cloudpool_location::{LocationError, SpecError};
use cloudpool_pool::PoolError;
use thiserror::Error;

pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("environment {0} has already been started")]
    AlreadyStarted(PoolId),

    #[error("environment {0} is not running")]
    NotRunning(PoolId),
}

impl EnvironmentError {
    /// The underlying pool error, if any.
    pub fn as_pool(&self) -> Option<&PoolError> {
        match self {
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning(_))
    }
}
