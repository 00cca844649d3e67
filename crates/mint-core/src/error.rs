use thiserror::Error;
use tx_chain::EngineError;

#[derive(Debug, Error)]
pub enum MintError {
    #[error("invalid mint request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl MintError {
    /// Whether the request can be retried as-is, i.e. nothing reached the
    /// network.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MintError::InvalidRequest(_) => true,
            MintError::Engine(e) => e.is_recoverable(),
        }
    }
}
