use bitcoin::Txid;
use thiserror::Error;

/// Transaction-chain engine errors.
///
/// Construction-phase failures leave no on-chain trace and can be retried
/// with adjusted parameters. Submission-phase failures are only retryable
/// when nothing was broadcast yet; see [`EngineError::is_recoverable`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid tweak: {0}")]
    InvalidTweak(String),

    #[error("insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    /// `value` is the parent output entering the link, `threshold` the least
    /// parent value the link could have been built from.
    #[error("chain underfunded at link {link}: parent carries {value} sat, link needs {threshold} sat")]
    ChainUnderfunded {
        link: usize,
        value: u64,
        threshold: u64,
    },

    #[error("malformed payload {index}: {reason}")]
    MalformedPayload { index: usize, reason: String },

    #[error("signing error: {0}")]
    SignFailed(String),

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    /// The broadcast call gave no answer; the transaction may or may not be
    /// on the network.
    #[error("broadcast outcome unknown: {0}")]
    BroadcastUnknown(String),

    #[error("chain stopped at link {failed_link} after {} broadcast(s): {source}", .completed.len())]
    PartialBroadcast {
        completed: Vec<Txid>,
        failed_link: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("chain cancelled after {} broadcast(s)", .completed.len())]
    Cancelled { completed: Vec<Txid> },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("invalid funding feed: {0}")]
    InvalidFundingFeed(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("utxo pool unavailable: {0}")]
    PoolUnavailable(String),
}

impl EngineError {
    /// Whether the caller may retry without reconciling on-chain state.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::PartialBroadcast { .. } => false,
            EngineError::BroadcastUnknown(_) => false,
            EngineError::Cancelled { completed } => completed.is_empty(),
            EngineError::PoolUnavailable(_) => false,
            _ => true,
        }
    }

    /// Whether the failing link may itself have reached the network, so
    /// the output it spends must not be reused.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            EngineError::BroadcastUnknown(_) => true,
            EngineError::PartialBroadcast { source, .. } => source.outcome_unknown(),
            _ => false,
        }
    }

    /// Transaction ids already broadcast when a chain stopped early.
    pub fn completed_txids(&self) -> &[Txid] {
        match self {
            EngineError::PartialBroadcast { completed, .. }
            | EngineError::Cancelled { completed } => completed,
            _ => &[],
        }
    }
}
