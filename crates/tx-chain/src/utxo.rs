use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Where the engine learned about an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoOrigin {
    /// Reported by the external funding feed.
    Remote,
    /// Created by a transaction this engine built; not yet indexed externally.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoStatus {
    Unspent,
    /// Provisionally held by an in-flight chain.
    Reserved,
    /// Included in a broadcast transaction.
    Spent,
}

/// A single unspent transaction output (UTXO).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub status: UtxoStatus,
    pub origin: UtxoOrigin,
}

impl UnspentOutput {
    pub fn remote(outpoint: OutPoint, value_sat: u64) -> Self {
        Self {
            outpoint,
            value_sat,
            status: UtxoStatus::Unspent,
            origin: UtxoOrigin::Remote,
        }
    }

    pub fn local(outpoint: OutPoint, value_sat: u64) -> Self {
        Self {
            outpoint,
            value_sat,
            status: UtxoStatus::Unspent,
            origin: UtxoOrigin::Local,
        }
    }

    pub fn is_spendable(&self) -> bool {
        self.status == UtxoStatus::Unspent
    }
}

/// One entry of the external funding feed, as delivered by an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingFeedEntry {
    /// Transaction ID as a hex string (big-endian / display order).
    pub txid: String,
    pub vout: u32,
    pub value_sat: u64,
}

impl TryFrom<&FundingFeedEntry> for UnspentOutput {
    type Error = EngineError;

    fn try_from(entry: &FundingFeedEntry) -> Result<Self, Self::Error> {
        let txid: Txid = entry
            .txid
            .parse()
            .map_err(|e| EngineError::InvalidFundingFeed(format!("invalid txid '{}': {e}", entry.txid)))?;
        Ok(UnspentOutput::remote(OutPoint::new(txid, entry.vout), entry.value_sat))
    }
}

/// Result of UTXO selection: the chosen UTXOs and their aggregate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub selected: Vec<UnspentOutput>,
    pub total_sat: u64,
}

impl SelectionResult {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.selected.iter().map(|u| u.outpoint).collect()
    }
}

/// Pool order: value descending, local before remote, then outpoint.
fn pool_order(a: &UnspentOutput, b: &UnspentOutput) -> Ordering {
    b.value_sat
        .cmp(&a.value_sat)
        .then_with(|| origin_rank(a.origin).cmp(&origin_rank(b.origin)))
        .then_with(|| a.outpoint.cmp(&b.outpoint))
}

fn origin_rank(origin: UtxoOrigin) -> u8 {
    match origin {
        UtxoOrigin::Local => 0,
        UtxoOrigin::Remote => 1,
    }
}

/// Select outputs from a pool sorted by [`UtxoPool`] order to cover `amount_sat`.
///
/// Prefers the smallest single output that covers the amount on its own,
/// keeping larger outputs free for later operations. Otherwise accumulates
/// from the largest down and stops as soon as the amount is reached.
/// Outputs that are not `Unspent` are skipped. The pool is not modified.
pub fn select_for_amount(
    pool: &[UnspentOutput],
    amount_sat: u64,
) -> Result<SelectionResult, EngineError> {
    if amount_sat == 0 {
        return Ok(SelectionResult {
            selected: Vec::new(),
            total_sat: 0,
        });
    }

    let spendable: Vec<&UnspentOutput> = pool.iter().filter(|u| u.is_spendable()).collect();

    // Scan from the tail (smallest) upward for the first output that covers
    // the amount, then take the head of that value's tie group so a local
    // output wins over an equal remote one.
    if let Some(smallest_cover) = spendable
        .iter()
        .rev()
        .find(|u| u.value_sat >= amount_sat)
        .map(|u| u.value_sat)
    {
        if let Some(single) = spendable.iter().find(|u| u.value_sat == smallest_cover) {
            return Ok(SelectionResult {
                selected: vec![(*single).clone()],
                total_sat: single.value_sat,
            });
        }
    }

    let mut selected = Vec::new();
    let mut total_sat: u64 = 0;
    for utxo in &spendable {
        selected.push((*utxo).clone());
        total_sat = total_sat.saturating_add(utxo.value_sat);
        if total_sat >= amount_sat {
            return Ok(SelectionResult {
                selected,
                total_sat,
            });
        }
    }

    Err(EngineError::InsufficientFunds {
        available: total_sat,
        required: amount_sat,
    })
}

/// An ordered, immutable view of known outputs.
///
/// Every transform returns a new pool; the caller swaps its reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoPool {
    outputs: Vec<UnspentOutput>,
}

impl UtxoPool {
    pub fn new(outputs: Vec<UnspentOutput>) -> Self {
        let mut seen = HashSet::new();
        let mut outputs: Vec<UnspentOutput> = outputs
            .into_iter()
            .filter(|u| seen.insert(u.outpoint))
            .collect();
        outputs.sort_by(pool_order);
        Self { outputs }
    }

    pub fn from_feed(entries: &[FundingFeedEntry]) -> Result<Self, EngineError> {
        let outputs = entries
            .iter()
            .map(UnspentOutput::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(outputs))
    }

    pub fn outputs(&self) -> &[UnspentOutput] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UnspentOutput> {
        self.outputs.iter().find(|u| &u.outpoint == outpoint)
    }

    pub fn spendable(&self) -> impl Iterator<Item = &UnspentOutput> {
        self.outputs.iter().filter(|u| u.is_spendable())
    }

    pub fn total_spendable_sat(&self) -> u64 {
        self.spendable()
            .fold(0u64, |acc, u| acc.saturating_add(u.value_sat))
    }

    pub fn select_for_amount(&self, amount_sat: u64) -> Result<SelectionResult, EngineError> {
        select_for_amount(&self.outputs, amount_sat)
    }

    /// Insert (or replace, by outpoint) one output.
    pub fn with_output(&self, output: UnspentOutput) -> Self {
        let mut outputs: Vec<UnspentOutput> = self
            .outputs
            .iter()
            .filter(|u| u.outpoint != output.outpoint)
            .cloned()
            .collect();
        outputs.push(output);
        Self::new(outputs)
    }

    pub fn with_status(&self, outpoints: &[OutPoint], status: UtxoStatus) -> Self {
        let outputs = self
            .outputs
            .iter()
            .map(|u| {
                if outpoints.contains(&u.outpoint) {
                    UnspentOutput {
                        status,
                        ..u.clone()
                    }
                } else {
                    u.clone()
                }
            })
            .collect();
        Self::new(outputs)
    }

    /// Evict outputs (confirmed spent, or explicitly dropped).
    pub fn without(&self, outpoints: &[OutPoint]) -> Self {
        let outputs = self
            .outputs
            .iter()
            .filter(|u| !outpoints.contains(&u.outpoint))
            .cloned()
            .collect();
        Self::new(outputs)
    }

    /// Merge a fresh feed snapshot.
    ///
    /// Remote outputs missing from the feed are dropped. Outputs that remain
    /// keep their reservation/spent status, and a local output seen in the
    /// feed becomes remote. Local outputs not yet indexed are kept.
    pub fn refreshed(&self, feed: &[FundingFeedEntry]) -> Result<Self, EngineError> {
        let known: HashMap<OutPoint, &UnspentOutput> =
            self.outputs.iter().map(|u| (u.outpoint, u)).collect();

        let mut outputs = Vec::with_capacity(feed.len());
        let mut reported = HashSet::new();
        for entry in feed {
            let mut fresh = UnspentOutput::try_from(entry)?;
            if let Some(existing) = known.get(&fresh.outpoint) {
                fresh.status = existing.status;
            }
            reported.insert(fresh.outpoint);
            outputs.push(fresh);
        }

        outputs.extend(
            self.outputs
                .iter()
                .filter(|u| u.origin == UtxoOrigin::Local && !reported.contains(&u.outpoint))
                .cloned(),
        );

        Ok(Self::new(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), 0)
    }

    fn remote(n: u8, value: u64) -> UnspentOutput {
        UnspentOutput::remote(op(n), value)
    }

    fn values(sel: &SelectionResult) -> Vec<u64> {
        sel.selected.iter().map(|u| u.value_sat).collect()
    }

    #[test]
    fn pool_is_sorted_descending() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 3_000), remote(3, 1_500)]);
        let vals: Vec<u64> = pool.outputs().iter().map(|u| u.value_sat).collect();
        assert_eq!(vals, vec![3_000, 1_500, 500]);
    }

    #[test]
    fn duplicate_outpoints_are_collapsed() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(1, 500)]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn selects_smallest_single_cover() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 1_500), remote(3, 3_000)]);
        let sel = pool.select_for_amount(1_200).unwrap();
        assert_eq!(values(&sel), vec![1_500]);
        assert_eq!(sel.total_sat, 1_500);
    }

    #[test]
    fn exact_match_is_a_single_cover() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 1_500), remote(3, 3_000)]);
        assert_eq!(values(&pool.select_for_amount(500).unwrap()), vec![500]);
    }

    #[test]
    fn single_cover_is_minimal_for_many_amounts() {
        let vals = [120u64, 7_000, 950, 3_300, 41, 950, 18_000, 2_200];
        let pool = UtxoPool::new(
            vals.iter()
                .enumerate()
                .map(|(i, v)| remote(i as u8, *v))
                .collect(),
        );

        for amount in [1u64, 41, 42, 500, 950, 951, 2_000, 3_300, 9_000, 18_000] {
            let sel = pool.select_for_amount(amount).unwrap();
            assert_eq!(sel.selected.len(), 1, "amount {amount}");
            let expected = vals.iter().copied().filter(|v| *v >= amount).min().unwrap();
            assert_eq!(sel.total_sat, expected, "amount {amount}");
        }
    }

    #[test]
    fn falls_back_to_largest_first_accumulation() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 1_500), remote(3, 3_000)]);
        let sel = pool.select_for_amount(4_000).unwrap();
        assert_eq!(values(&sel), vec![3_000, 1_500]);
    }

    #[test]
    fn fallback_never_over_selects() {
        let vals = [900u64, 400, 700, 300, 1_000, 200, 600];
        let pool = UtxoPool::new(
            vals.iter()
                .enumerate()
                .map(|(i, v)| remote(i as u8, *v))
                .collect(),
        );
        let total: u64 = vals.iter().sum();

        for amount in (1_001..=total).step_by(97) {
            let sel = pool.select_for_amount(amount).unwrap();
            assert!(sel.total_sat >= amount);
            let largest = sel.selected.iter().map(|u| u.value_sat).max().unwrap();
            assert!(
                sel.total_sat - largest < amount,
                "amount {amount} over-selected {:?}",
                values(&sel)
            );
        }
    }

    #[test]
    fn insufficient_funds_reports_totals() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 700)]);
        let err = pool.select_for_amount(5_000).unwrap_err();
        match err {
            EngineError::InsufficientFunds {
                available,
                required,
            } => {
                assert_eq!(available, 1_200);
                assert_eq!(required, 5_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_pool_is_insufficient() {
        let err = UtxoPool::default().select_for_amount(1).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { available: 0, .. }));
    }

    #[test]
    fn zero_amount_selects_nothing() {
        let sel = UtxoPool::default().select_for_amount(0).unwrap();
        assert!(sel.selected.is_empty());
    }

    #[test]
    fn local_output_wins_a_tie() {
        let pool = UtxoPool::new(vec![
            remote(1, 2_000),
            UnspentOutput::local(op(2), 2_000),
            remote(3, 9_000),
        ]);
        let sel = pool.select_for_amount(1_500).unwrap();
        assert_eq!(sel.selected[0].origin, UtxoOrigin::Local);
    }

    #[test]
    fn reserved_and_spent_outputs_are_skipped() {
        let pool = UtxoPool::new(vec![remote(1, 1_500), remote(2, 3_000), remote(3, 800)])
            .with_status(&[op(1)], UtxoStatus::Reserved)
            .with_status(&[op(3)], UtxoStatus::Spent);
        let sel = pool.select_for_amount(1_200).unwrap();
        assert_eq!(values(&sel), vec![3_000]);
        assert_eq!(pool.total_spendable_sat(), 3_000);
    }

    #[test]
    fn selection_does_not_mutate_pool() {
        let pool = UtxoPool::new(vec![remote(1, 500), remote(2, 1_500)]);
        let before = pool.clone();
        let _ = pool.select_for_amount(1_000).unwrap();
        assert_eq!(pool, before);
    }

    #[test]
    fn transforms_return_new_pools() {
        let pool = UtxoPool::new(vec![remote(1, 500)]);
        let grown = pool.with_output(UnspentOutput::local(op(2), 9_000));
        assert_eq!(pool.len(), 1);
        assert_eq!(grown.len(), 2);
        assert_eq!(grown.outputs()[0].value_sat, 9_000);

        let shrunk = grown.without(&[op(1)]);
        assert_eq!(shrunk.len(), 1);
        assert!(shrunk.get(&op(1)).is_none());
    }

    #[test]
    fn from_feed_rejects_bad_txid() {
        let feed = vec![FundingFeedEntry {
            txid: "zz".into(),
            vout: 0,
            value_sat: 1_000,
        }];
        let err = UtxoPool::from_feed(&feed).unwrap_err();
        assert!(matches!(err, EngineError::InvalidFundingFeed(_)));
    }

    #[test]
    fn feed_entries_deserialize_from_json() {
        let json = format!(
            r#"[{{ "txid": "{}", "vout": 1, "value_sat": 2500 }}]"#,
            "ab".repeat(32)
        );
        let feed: Vec<FundingFeedEntry> = serde_json::from_str(&json).unwrap();
        let pool = UtxoPool::from_feed(&feed).unwrap();
        assert_eq!(pool.outputs()[0].outpoint.vout, 1);
        assert_eq!(pool.outputs()[0].origin, UtxoOrigin::Remote);
    }

    #[test]
    fn refresh_keeps_status_and_unindexed_locals() {
        let txid_a = "aa".repeat(32);
        let txid_b = "bb".repeat(32);
        let pool = UtxoPool::from_feed(&[
            FundingFeedEntry {
                txid: txid_a.clone(),
                vout: 0,
                value_sat: 5_000,
            },
            FundingFeedEntry {
                txid: txid_b,
                vout: 0,
                value_sat: 7_000,
            },
        ])
        .unwrap();
        let reserved_op = OutPoint::new(txid_a.parse().unwrap(), 0);
        let pool = pool
            .with_status(&[reserved_op], UtxoStatus::Reserved)
            .with_output(UnspentOutput::local(op(9), 1_000));

        // b disappeared from the feed (spent elsewhere); a is still there.
        let refreshed = pool
            .refreshed(&[FundingFeedEntry {
                txid: txid_a,
                vout: 0,
                value_sat: 5_000,
            }])
            .unwrap();

        assert_eq!(refreshed.len(), 2);
        assert_eq!(refreshed.get(&reserved_op).unwrap().status, UtxoStatus::Reserved);
        assert_eq!(refreshed.get(&op(9)).unwrap().origin, UtxoOrigin::Local);
    }
}
