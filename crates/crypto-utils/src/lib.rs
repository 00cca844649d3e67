//! # crypto-utils
//!
//! Tagged hashing, secret-memory hygiene, and secure random generation
//! shared by the transaction-chain engine.

pub mod error;
pub mod hash;
pub mod random;
pub mod zeroizing;

pub use error::CryptoError;
