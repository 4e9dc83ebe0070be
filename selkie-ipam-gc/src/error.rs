use thiserror::Error;

use crate::config::ConfError;

/// Top-level error for the controller binary.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubernetes caches never became ready: {0}")]
    CacheSync(String),

    #[error("signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GcError>;
