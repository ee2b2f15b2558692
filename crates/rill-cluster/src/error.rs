use rill_common::error::CommonError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("error in common library: {0}")]
    CommonError(#[from] CommonError),
}
