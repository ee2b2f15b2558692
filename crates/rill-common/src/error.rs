use thiserror::Error;

pub type CommonResult<T> = Result<T, CommonError>;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("internal error: {0}")]
    InternalError(String),
}
