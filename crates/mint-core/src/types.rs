use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tx_chain::{FeePlan, PayloadDescriptor, UnspentOutput};

use crate::error::MintError;

/// A batch of payloads to commit and the address that receives the final
/// output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintRequest {
    pub payloads: Vec<PayloadDescriptor>,
    pub destination: String,
    /// Point-in-time network fee rate in sat/vB.
    pub fee_rate_sat_vb: f64,
    /// Service-fee discount in percent; out-of-range values are clamped.
    #[serde(default)]
    pub discount_percent: i64,
}

impl MintRequest {
    pub fn validate(&self) -> Result<(), MintError> {
        if self.payloads.is_empty() {
            return Err(MintError::InvalidRequest("no payloads".into()));
        }
        if self.destination.trim().is_empty() {
            return Err(MintError::InvalidRequest("destination is empty".into()));
        }
        Ok(())
    }

    pub fn payload_sizes(&self) -> Vec<u64> {
        self.payloads.iter().map(PayloadDescriptor::size_bytes).collect()
    }
}

/// What a batch will cost, computed without touching the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MintQuote {
    /// Batch-level fee summary (network and service fee).
    pub fee_plan: FeePlan,
    /// Network fee paid by each chain link, in link order.
    pub link_fees: Vec<u64>,
    /// Least funding output the chain can be built from.
    pub funding_required_sat: u64,
}

impl MintQuote {
    pub fn link_count(&self) -> usize {
        self.link_fees.len()
    }
}

/// Outcome of a fully broadcast batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MintReceipt {
    pub funding: OutPoint,
    pub txids: Vec<Txid>,
    pub fee_plan: FeePlan,
    /// Surplus returned to the engine by the last link, now in the pool.
    pub refund: Option<UnspentOutput>,
}
