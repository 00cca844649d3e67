use std::sync::{Mutex, MutexGuard};

use bitcoin::OutPoint;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::utxo::{FundingFeedEntry, SelectionResult, UnspentOutput, UtxoPool, UtxoStatus};

/// The UTXO pool shared by concurrently running chains.
///
/// Selection and reservation happen under one lock, so two chains can never
/// pick the same funding output. The guarded value is an immutable
/// [`UtxoPool`] that is swapped wholesale on every change.
#[derive(Debug, Default)]
pub struct SharedUtxoPool {
    inner: Mutex<UtxoPool>,
}

impl SharedUtxoPool {
    pub fn new(pool: UtxoPool) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, UtxoPool>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::PoolUnavailable("utxo pool lock poisoned".into()))
    }

    /// A copy of the current pool.
    pub fn snapshot(&self) -> Result<UtxoPool, EngineError> {
        Ok(self.lock()?.clone())
    }

    /// Select outputs covering `amount_sat` and mark them `Reserved`.
    pub fn reserve_for_amount(&self, amount_sat: u64) -> Result<SelectionResult, EngineError> {
        let mut guard = self.lock()?;
        let selection = guard.select_for_amount(amount_sat)?;
        *guard = guard.with_status(&selection.outpoints(), UtxoStatus::Reserved);
        debug!(
            amount_sat,
            inputs = selection.selected.len(),
            total_sat = selection.total_sat,
            "reserved funding outputs"
        );
        Ok(selection)
    }

    /// Like [`reserve_for_amount`](Self::reserve_for_amount) but only accepts
    /// a single output; chains spend exactly one parent.
    pub fn reserve_single(&self, amount_sat: u64) -> Result<UnspentOutput, EngineError> {
        let mut guard = self.lock()?;
        let largest = guard.spendable().map(|u| u.value_sat).max().unwrap_or(0);
        let insufficient = || EngineError::InsufficientFunds {
            available: largest,
            required: amount_sat,
        };

        let selection = guard
            .select_for_amount(amount_sat)
            .map_err(|_| insufficient())?;
        let [chosen]: [UnspentOutput; 1] = selection
            .selected
            .try_into()
            .map_err(|_| insufficient())?;

        *guard = guard.with_status(&[chosen.outpoint], UtxoStatus::Reserved);
        debug!(outpoint = %chosen.outpoint, value_sat = chosen.value_sat, "reserved single funding output");
        Ok(UnspentOutput {
            status: UtxoStatus::Reserved,
            ..chosen
        })
    }

    /// Return reserved outputs to the spendable set.
    pub fn release(&self, outpoints: &[OutPoint]) -> Result<(), EngineError> {
        let mut guard = self.lock()?;
        *guard = guard.with_status(outpoints, UtxoStatus::Unspent);
        debug!(count = outpoints.len(), "released reservation");
        Ok(())
    }

    pub fn mark_spent(&self, outpoints: &[OutPoint]) -> Result<(), EngineError> {
        let mut guard = self.lock()?;
        *guard = guard.with_status(outpoints, UtxoStatus::Spent);
        Ok(())
    }

    /// Evict outputs whose spend has confirmed.
    pub fn confirm(&self, outpoints: &[OutPoint]) -> Result<(), EngineError> {
        let mut guard = self.lock()?;
        *guard = guard.without(outpoints);
        Ok(())
    }

    pub fn insert_local(&self, output: UnspentOutput) -> Result<(), EngineError> {
        let mut guard = self.lock()?;
        debug!(outpoint = %output.outpoint, value_sat = output.value_sat, "tracking local output");
        *guard = guard.with_output(output);
        Ok(())
    }

    /// Merge a new funding-feed snapshot.
    pub fn refresh(&self, feed: &[FundingFeedEntry]) -> Result<(), EngineError> {
        let mut guard = self.lock()?;
        let next = guard.refreshed(feed)?;
        info!(
            before = guard.len(),
            after = next.len(),
            spendable_sat = next.total_spendable_sat(),
            "refreshed utxo pool"
        );
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), 0)
    }

    fn shared(values: &[u64]) -> SharedUtxoPool {
        SharedUtxoPool::new(UtxoPool::new(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| UnspentOutput::remote(op(i as u8 + 1), *v))
                .collect(),
        ))
    }

    #[test]
    fn reservation_hides_output_from_next_selection() {
        let pool = shared(&[1_500, 3_000]);
        let first = pool.reserve_for_amount(1_000).unwrap();
        let second = pool.reserve_for_amount(1_000).unwrap();
        assert_eq!(first.selected[0].value_sat, 1_500);
        assert_eq!(second.selected[0].value_sat, 3_000);
        assert!(pool.reserve_for_amount(1_000).is_err());
    }

    #[test]
    fn release_makes_output_selectable_again() {
        let pool = shared(&[1_500]);
        let sel = pool.reserve_for_amount(1_000).unwrap();
        pool.release(&sel.outpoints()).unwrap();
        assert!(pool.reserve_for_amount(1_000).is_ok());
    }

    #[test]
    fn reserve_single_picks_smallest_sufficient_output() {
        let pool = shared(&[500, 1_500, 3_000]);
        let chosen = pool.reserve_single(1_200).unwrap();
        assert_eq!(chosen.value_sat, 1_500);
        assert_eq!(chosen.status, UtxoStatus::Reserved);
    }

    #[test]
    fn reserve_single_does_not_combine_outputs() {
        let pool = shared(&[500, 1_500, 3_000]);
        let err = pool.reserve_single(4_000).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                available: 3_000,
                required: 4_000
            }
        ));
    }

    #[test]
    fn confirm_evicts_and_insert_local_adds() {
        let pool = shared(&[1_500]);
        pool.mark_spent(&[op(1)]).unwrap();
        pool.confirm(&[op(1)]).unwrap();
        assert!(pool.snapshot().unwrap().is_empty());

        pool.insert_local(UnspentOutput::local(op(9), 700)).unwrap();
        assert_eq!(pool.snapshot().unwrap().total_spendable_sat(), 700);
    }

    #[test]
    fn concurrent_reservations_never_share_an_output() {
        let pool = Arc::new(shared(&[2_000; 16]));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.reserve_single(1_000).ok())
            })
            .collect();

        let reserved: Vec<OutPoint> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .map(|u| u.outpoint)
            .collect();

        assert_eq!(reserved.len(), 16);
        let unique: std::collections::HashSet<_> = reserved.iter().collect();
        assert_eq!(unique.len(), 16);
    }
}
