use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("connection primitive error: {0}")]
    Primitive(String),
    #[error("session closed")]
    Closed,
    #[error("signal transfer failed: {0}")]
    Transfer(String),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("timed out")]
    Timeout,
}

pub(crate) fn to_primitive_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Primitive(err.to_string())
}

pub(crate) fn to_transfer_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Transfer(err.to_string())
}
