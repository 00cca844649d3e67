//! Taproot transaction-chain engine.
//!
//! Derives key-path signing keys, prices and selects funding, builds chains
//! of single-input transactions in which each link spends the previous
//! link's change, and submits them one by one.

pub mod chain;
pub mod config;
pub mod error;
pub mod fee;
pub mod key;
pub mod network;
pub mod payload;
pub mod pool;
pub mod submit;
pub mod utxo;

pub use chain::{build_chain, required_funding, ChainLayout, LinkScripts, TransactionLink};
pub use config::EngineConfig;
pub use error::EngineError;
pub use fee::{FeePlan, FixedLinkFee, LinkFeePolicy, SizeAwareLinkFee};
pub use key::{derive_signing_key, generate_ephemeral_key, SigningKey};
pub use network::BtcNetwork;
pub use payload::PayloadDescriptor;
pub use pool::SharedUtxoPool;
pub use submit::{
    Broadcaster, ChainSigner, ChainSubmitter, IntervalPacer, LocalSigner, NoDelay, Pacer,
    ProviderSigner, WalletProvider,
};
pub use utxo::{FundingFeedEntry, SelectionResult, UnspentOutput, UtxoPool};
