use thiserror::Error;

/// Errors surfaced synchronously by registration, pack and log calls.
///
/// Transport and handshake failures that happen inside `service()` are *not* returned to the
///  caller: they demote the affected endpoint to `Broken` and are only logged. They still use this
///  type internally so the endpoint code can propagate them with `?`.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("framing error: {0}")]
    Framing(String),
    #[error("table full: {0}")]
    TableFull(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// true for errors that mean the peer session is gone for good, as opposed to a
    ///  problem with a single message
    pub fn is_fatal_for_endpoint(&self) -> bool {
        !matches!(self, BusError::NotFound(_) | BusError::InvalidId(_) | BusError::Config(_))
    }
}
