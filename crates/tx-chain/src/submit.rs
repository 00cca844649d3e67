use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::Txid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::TransactionLink;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::key::SigningKey;

/// Relays a raw signed transaction to the network.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, EngineError>;
}

#[async_trait]
impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, EngineError> {
        (**self).broadcast(raw_tx_hex).await
    }
}

/// An external wallet that signs a PSBT with its own key and broadcasts it.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn sign_and_broadcast(&self, psbt: Psbt) -> Result<Txid, EngineError>;
}

#[async_trait]
impl<T: WalletProvider + ?Sized> WalletProvider for Arc<T> {
    async fn sign_and_broadcast(&self, psbt: Psbt) -> Result<Txid, EngineError> {
        (**self).sign_and_broadcast(psbt).await
    }
}

/// Gets one chain link signed and onto the network.
#[async_trait]
pub trait ChainSigner: Send + Sync {
    async fn sign_and_broadcast(&self, link: &mut TransactionLink) -> Result<Txid, EngineError>;
}

/// Signs with a key held by the engine and hands the raw transaction to a
/// [`Broadcaster`].
pub struct LocalSigner<B> {
    pub key: Arc<SigningKey>,
    pub broadcaster: B,
}

impl<B: Broadcaster> LocalSigner<B> {
    pub fn new(key: Arc<SigningKey>, broadcaster: B) -> Self {
        Self { key, broadcaster }
    }
}

#[async_trait]
impl<B: Broadcaster> ChainSigner for LocalSigner<B> {
    async fn sign_and_broadcast(&self, link: &mut TransactionLink) -> Result<Txid, EngineError> {
        let raw = link.sign_with(&self.key)?.to_owned();
        self.broadcaster.broadcast(&raw).await
    }
}

/// Delegates signing and broadcast to a [`WalletProvider`].
pub struct ProviderSigner<W> {
    pub provider: W,
}

impl<W: WalletProvider> ProviderSigner<W> {
    pub fn new(provider: W) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<W: WalletProvider> ChainSigner for ProviderSigner<W> {
    async fn sign_and_broadcast(&self, link: &mut TransactionLink) -> Result<Txid, EngineError> {
        let psbt = link.to_psbt()?;
        self.provider.sign_and_broadcast(psbt).await
    }
}

/// Waits between two broadcasts so the parent can propagate before its
/// child is relayed.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn settle(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalPacer {
    pub interval: Duration,
}

#[async_trait]
impl Pacer for IntervalPacer {
    async fn settle(&self) {
        tokio::time::sleep(self.interval).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl Pacer for NoDelay {
    async fn settle(&self) {}
}

/// Submits a chain one link at a time.
#[derive(Debug, Clone)]
pub struct ChainSubmitter<P = IntervalPacer> {
    pacer: P,
    timeout: Duration,
}

impl ChainSubmitter<IntervalPacer> {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            IntervalPacer {
                interval: config.settle_interval(),
            },
            config.broadcast_timeout(),
        )
    }
}

impl<P: Pacer> ChainSubmitter<P> {
    pub fn new(pacer: P, timeout: Duration) -> Self {
        Self { pacer, timeout }
    }

    pub async fn submit_chain(
        &self,
        chain: &mut [TransactionLink],
        signer: &dyn ChainSigner,
    ) -> Result<Vec<Txid>, EngineError> {
        self.submit_chain_cancellable(chain, signer, &CancellationToken::new())
            .await
    }

    /// Sign and broadcast every link in order, returning their txids.
    ///
    /// Link `i + 1` is only touched once link `i` is on the network. A
    /// failure after the first broadcast is reported as `PartialBroadcast`;
    /// links already broadcast are never undone. A call that outlives the
    /// timeout yields `BroadcastUnknown`, since the link may still have been
    /// relayed.
    pub async fn submit_chain_cancellable(
        &self,
        chain: &mut [TransactionLink],
        signer: &dyn ChainSigner,
        cancel: &CancellationToken,
    ) -> Result<Vec<Txid>, EngineError> {
        let total = chain.len();
        let mut completed: Vec<Txid> = Vec::with_capacity(total);

        for (position, link) in chain.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                warn!(completed = completed.len(), total, "chain submission cancelled");
                return Err(EngineError::Cancelled { completed });
            }

            let index = link.index;
            let expected = link.resulting_txid;
            let outcome = match tokio::time::timeout(self.timeout, signer.sign_and_broadcast(link)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::BroadcastUnknown(format!(
                    "link {index} got no answer within {:?}",
                    self.timeout
                ))),
            };

            match outcome {
                Ok(txid) if txid == expected => {
                    info!(link = index, %txid, "broadcast chain link");
                    completed.push(txid);
                }
                Ok(txid) => {
                    // Something reached the network, so the parent is gone
                    // even though the next link cannot spend it.
                    warn!(link = index, %txid, %expected, "broadcast returned unexpected txid");
                    completed.push(txid);
                    return Err(EngineError::PartialBroadcast {
                        completed,
                        failed_link: index,
                        source: Box::new(EngineError::BroadcastFailed(format!(
                            "link {index} broadcast as {txid}, expected {expected}"
                        ))),
                    });
                }
                Err(err) if completed.is_empty() => {
                    warn!(link = index, error = %err, "chain submission failed at its first link");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        link = index,
                        completed = completed.len(),
                        error = %err,
                        "chain submission stopped part-way"
                    );
                    return Err(EngineError::PartialBroadcast {
                        completed,
                        failed_link: index,
                        source: Box::new(err),
                    });
                }
            }

            if position + 1 < total {
                debug!(link = index, "waiting for parent to settle");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!(completed = completed.len(), total, "chain submission cancelled");
                        return Err(EngineError::Cancelled { completed });
                    }
                    _ = self.pacer.settle() => {}
                }
            }
        }

        Ok(completed)
    }
}
