//! Batch minting on top of the `tx-chain` engine.
//!
//! [`BatchMinter`] funds one chain per batch from a shared UTXO pool, submits
//! it, and keeps the pool consistent with what actually reached the network.

pub mod error;
pub mod minter;
pub mod telemetry;
pub mod types;

pub use error::MintError;
pub use minter::BatchMinter;
pub use telemetry::init_tracing;
pub use types::{MintQuote, MintReceipt, MintRequest};
