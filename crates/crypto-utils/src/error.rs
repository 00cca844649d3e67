use thiserror::Error;

/// Cryptographic helper errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no acceptable random value after {0} attempts")]
    RandomnessExhausted(usize),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
