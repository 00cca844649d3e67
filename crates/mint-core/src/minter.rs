use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tx_chain::chain::{
    build_chain, destination_script, link_fees, required_funding, ChainLayout, LinkScripts,
    TransactionLink, P2TR_SCRIPT_LEN,
};
use tx_chain::fee::{plan_fees, validate_fee_rate, FeePlanRequest, SizeAwareLinkFee};
use tx_chain::submit::{ChainSigner, ChainSubmitter, IntervalPacer, Pacer};
use tx_chain::{EngineConfig, EngineError, SharedUtxoPool, SigningKey};

use crate::error::MintError;
use crate::types::{MintQuote, MintReceipt, MintRequest};

/// Outputs per link assumed by the batch-level fee plan.
const OUTPUTS_PER_LINK: u64 = 2;

/// Runs batches end to end: quote, reserve funding, build, submit, and
/// reconcile the shared pool with what reached the network.
pub struct BatchMinter<P = IntervalPacer> {
    config: EngineConfig,
    pool: Arc<SharedUtxoPool>,
    submitter: ChainSubmitter<P>,
}

impl BatchMinter<IntervalPacer> {
    pub fn new(config: EngineConfig, pool: Arc<SharedUtxoPool>) -> Result<Self, MintError> {
        let submitter = ChainSubmitter::from_config(&config);
        Self::with_submitter(config, pool, submitter)
    }
}

impl<P: Pacer> BatchMinter<P> {
    pub fn with_submitter(
        config: EngineConfig,
        pool: Arc<SharedUtxoPool>,
        submitter: ChainSubmitter<P>,
    ) -> Result<Self, MintError> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            submitter,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SharedUtxoPool> {
        &self.pool
    }

    /// Price a batch. The pool is not consulted.
    pub fn quote(&self, request: &MintRequest) -> Result<MintQuote, MintError> {
        request.validate()?;
        validate_fee_rate(request.fee_rate_sat_vb)?;

        let destination = destination_script(&request.destination, self.config.network)?;
        let scripts = LinkScripts {
            change_len: P2TR_SCRIPT_LEN,
            destination_len: destination.len(),
        };
        let policy = SizeAwareLinkFee {
            fee_rate_sat_vb: request.fee_rate_sat_vb,
        };
        let link_fees = link_fees(&request.payloads, scripts, &policy)?;
        let funding_required_sat = required_funding(
            &request.payloads,
            scripts,
            &policy,
            self.config.min_output_value_sat,
        )?;

        let sizes = request.payload_sizes();
        let fee_plan = plan_fees(
            &FeePlanRequest {
                fee_rate_sat_vb: request.fee_rate_sat_vb,
                payload_sizes: &sizes,
                total_tx_size_bytes: sizes.iter().sum(),
                output_count: OUTPUTS_PER_LINK * link_fees.len() as u64,
                discount_percent: request.discount_percent,
            },
            &self.config,
        )?;

        Ok(MintQuote {
            fee_plan,
            link_fees,
            funding_required_sat,
        })
    }

    pub async fn mint(
        &self,
        request: &MintRequest,
        key: &SigningKey,
        signer: &dyn ChainSigner,
    ) -> Result<MintReceipt, MintError> {
        self.mint_cancellable(request, key, signer, &CancellationToken::new())
            .await
    }

    /// Mint a batch funded from the shared pool.
    ///
    /// `key` must control the pool's outputs; change and refunds are paid
    /// back to its script. The funding output is released if nothing was
    /// broadcast and marked spent otherwise. When the last broadcast got no
    /// answer, its parent's change is not restored.
    pub async fn mint_cancellable(
        &self,
        request: &MintRequest,
        key: &SigningKey,
        signer: &dyn ChainSigner,
        cancel: &CancellationToken,
    ) -> Result<MintReceipt, MintError> {
        if key.network() != self.config.network {
            return Err(MintError::InvalidRequest(format!(
                "key is for {}, engine runs on {}",
                key.network(),
                self.config.network
            )));
        }
        let quote = self.quote(request)?;
        let funding = self.pool.reserve_single(quote.funding_required_sat)?;
        info!(
            payloads = request.payloads.len(),
            links = quote.link_count(),
            funding = %funding.outpoint,
            funding_sat = funding.value_sat,
            required_sat = quote.funding_required_sat,
            "minting batch"
        );

        let policy = SizeAwareLinkFee {
            fee_rate_sat_vb: request.fee_rate_sat_vb,
        };
        let built = build_chain(
            &funding,
            key.script_pubkey(),
            &request.payloads,
            &request.destination,
            &policy,
            &ChainLayout::from_config(&self.config),
        );
        let mut chain = match built {
            Ok(chain) => chain,
            Err(err) => {
                self.release_quietly(&funding.outpoint);
                return Err(err.into());
            }
        };

        match self
            .submitter
            .submit_chain_cancellable(&mut chain, signer, cancel)
            .await
        {
            Ok(txids) => {
                self.pool.mark_spent(&[funding.outpoint])?;
                let refund = chain.last().and_then(|link| link.refund_output.clone());
                if let Some(refund) = &refund {
                    self.pool.insert_local(refund.clone())?;
                }
                info!(
                    txids = txids.len(),
                    refund_sat = refund.as_ref().map(|r| r.value_sat).unwrap_or(0),
                    "batch minted"
                );
                Ok(MintReceipt {
                    funding: funding.outpoint,
                    txids,
                    fee_plan: quote.fee_plan,
                    refund,
                })
            }
            Err(err) if err.is_recoverable() => {
                self.release_quietly(&funding.outpoint);
                Err(err.into())
            }
            Err(err) => {
                self.pool.mark_spent(&[funding.outpoint])?;
                if err.outcome_unknown() {
                    warn!(
                        funding = %funding.outpoint,
                        completed = err.completed_txids().len(),
                        "broadcast outcome unknown, not restoring change"
                    );
                } else {
                    self.keep_stranded_change(&chain, err.completed_txids())?;
                }
                Err(err.into())
            }
        }
    }

    /// Track the change of the last broadcast link, which no later link
    /// spent.
    fn keep_stranded_change(
        &self,
        chain: &[TransactionLink],
        completed: &[bitcoin::Txid],
    ) -> Result<(), EngineError> {
        let Some(last_txid) = completed.last() else {
            return Ok(());
        };
        let stranded = chain
            .get(completed.len() - 1)
            .filter(|link| link.resulting_txid == *last_txid)
            .and_then(|link| link.change_output.clone());

        if let Some(change) = stranded {
            warn!(
                outpoint = %change.outpoint,
                value_sat = change.value_sat,
                "chain stopped early, keeping its change spendable"
            );
            self.pool.insert_local(change)?;
        }
        Ok(())
    }

    fn release_quietly(&self, outpoint: &bitcoin::OutPoint) {
        if let Err(e) = self.pool.release(std::slice::from_ref(outpoint)) {
            warn!(%outpoint, error = %e, "could not release funding reservation");
        }
    }
}
