use std::ops::Range;
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::script::ScriptBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fee::{LinkFeePolicy, LinkShape};
use crate::key::SigningKey;
use crate::network::BtcNetwork;
use crate::payload::{combined_commitment, data_carrier_script, PayloadDescriptor};
use crate::utxo::UnspentOutput;

/// Below this many payloads everything fits in a single transaction.
const MIN_PAYLOADS_FOR_CHAIN: usize = 3;

/// Every link carries its data commitment at vout 0 ...
const DATA_CARRIER_VOUT: usize = 0;
/// ... and its change or destination output at vout 1.
const CONTINUATION_VOUT: u32 = 1;

/// Length of the engine's own `OP_1 <32-byte key>` script.
pub const P2TR_SCRIPT_LEN: usize = 34;

/// A key-path witness is one BIP-340 signature under `SIGHASH_DEFAULT`.
const KEY_PATH_SIGNATURE_LEN: usize = 64;

/// One transaction of a funding chain.
#[derive(Debug, Clone)]
pub struct TransactionLink {
    pub index: usize,
    /// Output this link spends: the funding output for link 0, the previous
    /// link's change otherwise.
    pub parent_output: OutPoint,
    /// The `TxOut` behind `parent_output`, needed for the BIP-341 sighash.
    pub prevout: TxOut,
    pub unsigned_tx: Transaction,
    /// Raw signed transaction, filled in by [`TransactionLink::sign_with`].
    pub signed_hex: Option<String>,
    /// Known before signing: key-path witnesses do not affect the txid.
    pub resulting_txid: Txid,
    pub change_output: Option<UnspentOutput>,
    pub refund_output: Option<UnspentOutput>,
    /// Indices into the payload list committed by this link.
    pub payload_range: Range<usize>,
    pub fee_sat: u64,
}

impl TransactionLink {
    pub fn is_terminal(&self) -> bool {
        self.change_output.is_none()
    }

    /// Sign the link's single input and store the raw transaction.
    pub fn sign_with(&mut self, key: &SigningKey) -> Result<&str, EngineError> {
        let signed = key.sign_key_path(&self.unsigned_tx, std::slice::from_ref(&self.prevout))?;
        let txid = signed.compute_txid();
        if txid != self.resulting_txid {
            return Err(EngineError::SignFailed(format!(
                "signed link {} has txid {txid}, expected {}",
                self.index, self.resulting_txid
            )));
        }
        Ok(self.signed_hex.insert(serialize_hex(&signed)).as_str())
    }

    /// A PSBT for an external wallet, carrying the spent output as witness UTXO.
    pub fn to_psbt(&self) -> Result<Psbt, EngineError> {
        let mut psbt = Psbt::from_unsigned_tx(self.unsigned_tx.clone())
            .map_err(|e| EngineError::SignFailed(format!("psbt for link {}: {e}", self.index)))?;
        psbt.inputs[0].witness_utxo = Some(self.prevout.clone());
        Ok(psbt)
    }
}

/// Chain-wide settings shared by every link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub network: BtcNetwork,
    pub min_output_value_sat: u64,
    pub max_payload_bytes: usize,
}

impl ChainLayout {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            network: config.network,
            min_output_value_sat: config.min_output_value_sat,
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

/// Payload index ranges, one per link.
///
/// `n < 3` payloads share one transaction. Otherwise link `i` commits payload
/// `i` and the last link commits the final two, giving `n - 1` links.
pub fn link_ranges(payload_count: usize) -> Vec<Range<usize>> {
    match payload_count {
        0 => Vec::new(),
        n if n < MIN_PAYLOADS_FOR_CHAIN => vec![0..n],
        n => {
            let mut ranges: Vec<Range<usize>> = (0..n - 2).map(|i| i..i + 1).collect();
            ranges.push(n - 2..n);
            ranges
        }
    }
}

/// Lengths of the scripts a chain pays to. Amounts and payload bodies never
/// change a link's size, so these are all that sizing needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkScripts {
    /// The engine's script, receiving change and refunds.
    pub change_len: usize,
    pub destination_len: usize,
}

impl LinkScripts {
    pub fn new(change: &ScriptBuf, destination: &ScriptBuf) -> Self {
        Self {
            change_len: change.len(),
            destination_len: destination.len(),
        }
    }
}

/// Virtual size of a signed link paying the data carrier plus outputs with
/// the given script lengths.
pub fn estimate_link_vsize(output_script_lens: &[usize]) -> u64 {
    let mut output = vec![TxOut {
        value: Amount::ZERO,
        script_pubkey: data_carrier_script(&[0u8; 32]),
    }];
    output.extend(output_script_lens.iter().map(|len| TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::from_bytes(vec![0u8; *len]),
    }));

    let mut template = link_transaction(OutPoint::null(), output);
    template.input[0].witness = Witness::from_slice(&[[0u8; KEY_PATH_SIGNATURE_LEN]]);
    template.vsize() as u64
}

/// The shape of each link, as priced by a [`LinkFeePolicy`]. The terminal
/// link is shaped without a refund output.
pub fn link_shapes(payloads: &[PayloadDescriptor], scripts: LinkScripts) -> Vec<LinkShape> {
    let ranges = link_ranges(payloads.len());
    let last_index = ranges.len().saturating_sub(1);
    ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let continuation = if index < last_index {
                scripts.change_len
            } else {
                scripts.destination_len
            };
            LinkShape {
                index,
                payload_bytes: payloads[range].iter().map(PayloadDescriptor::size_bytes).sum(),
                output_count: 2,
                vsize: estimate_link_vsize(&[continuation]),
            }
        })
        .collect()
}

/// The terminal link's shape once a refund output is added.
pub fn refund_shape(terminal: &LinkShape, scripts: LinkScripts) -> LinkShape {
    LinkShape {
        output_count: terminal.output_count + 1,
        vsize: estimate_link_vsize(&[scripts.destination_len, scripts.change_len]),
        ..*terminal
    }
}

/// Per-link network fees in link order.
pub fn link_fees(
    payloads: &[PayloadDescriptor],
    scripts: LinkScripts,
    fee_policy: &dyn LinkFeePolicy,
) -> Result<Vec<u64>, EngineError> {
    link_shapes(payloads, scripts)
        .iter()
        .map(|shape| fee_policy.link_fee(shape))
        .collect()
}

/// Least funding value from which [`build_chain`] succeeds.
///
/// Each intermediate change must stay strictly above `min_output_value_sat`
/// and the terminal link must still pay `min_output_value_sat`.
pub fn required_funding(
    payloads: &[PayloadDescriptor],
    scripts: LinkScripts,
    fee_policy: &dyn LinkFeePolicy,
    min_output_value_sat: u64,
) -> Result<u64, EngineError> {
    let fees = link_fees(payloads, scripts, fee_policy)?;
    let Some((last, intermediate)) = fees.split_last() else {
        return Ok(0);
    };

    let mut spent = 0u64;
    let mut required = 0u64;
    for fee in intermediate {
        spent = spent.saturating_add(*fee);
        required = required.max(spent.saturating_add(min_output_value_sat).saturating_add(1));
    }
    spent = spent.saturating_add(*last);
    Ok(required.max(spent.saturating_add(min_output_value_sat)))
}

/// Build the funding chain for `payloads`.
///
/// `funding_script` is the engine's own script: it locks `funding` and
/// receives every change and refund output. Nothing is returned unless every
/// payload validates and every link is funded.
pub fn build_chain(
    funding: &UnspentOutput,
    funding_script: &ScriptBuf,
    payloads: &[PayloadDescriptor],
    destination: &str,
    fee_policy: &dyn LinkFeePolicy,
    layout: &ChainLayout,
) -> Result<Vec<TransactionLink>, EngineError> {
    if payloads.is_empty() {
        return Err(EngineError::MalformedPayload {
            index: 0,
            reason: "no payloads to commit".into(),
        });
    }
    for (index, payload) in payloads.iter().enumerate() {
        payload.validate(index, layout.max_payload_bytes)?;
    }
    let destination_script = destination_script(destination, layout.network)?;

    let scripts = LinkScripts::new(funding_script, &destination_script);
    let shapes = link_shapes(payloads, scripts);
    let fees = shapes
        .iter()
        .map(|shape| fee_policy.link_fee(shape))
        .collect::<Result<Vec<u64>, _>>()?;
    let refund_fee = match shapes.last() {
        Some(terminal) => fee_policy.link_fee(&refund_shape(terminal, scripts))?,
        None => 0,
    };
    let ranges = link_ranges(payloads.len());
    let min_output = layout.min_output_value_sat;
    let last_index = ranges.len() - 1;

    let mut links = Vec::with_capacity(ranges.len());
    let mut parent_output = funding.outpoint;
    let mut prevout = TxOut {
        value: Amount::from_sat(funding.value_sat),
        script_pubkey: funding_script.clone(),
    };

    for (index, (range, fee)) in ranges.into_iter().zip(fees).enumerate() {
        let parent_value = prevout.value.to_sat();
        let committed = &payloads[range.clone()];
        let commitment = if index < last_index {
            committed[0].commitment()
        } else {
            combined_commitment(committed)
        };
        let carrier = TxOut {
            value: Amount::ZERO,
            script_pubkey: data_carrier_script(&commitment),
        };

        let link = if index < last_index {
            let change = parent_value.saturating_sub(fee);
            if parent_value < fee || change <= min_output {
                return Err(EngineError::ChainUnderfunded {
                    link: index,
                    value: parent_value,
                    threshold: fee.saturating_add(min_output).saturating_add(1),
                });
            }
            let change_txout = TxOut {
                value: Amount::from_sat(change),
                script_pubkey: funding_script.clone(),
            };
            let tx = link_transaction(parent_output, vec![carrier, change_txout.clone()]);
            let txid = tx.compute_txid();
            let change_output =
                UnspentOutput::local(OutPoint::new(txid, CONTINUATION_VOUT), change);

            TransactionLink {
                index,
                parent_output,
                prevout: std::mem::replace(&mut prevout, change_txout),
                unsigned_tx: tx,
                signed_hex: None,
                resulting_txid: txid,
                change_output: Some(change_output),
                refund_output: None,
                payload_range: range,
                fee_sat: fee,
            }
        } else {
            let required = fee.saturating_add(min_output);
            if parent_value < required {
                return Err(EngineError::ChainUnderfunded {
                    link: index,
                    value: parent_value,
                    threshold: required,
                });
            }
            // The refund output makes the link larger, so it pays `refund_fee`.
            let refund = parent_value.saturating_sub(refund_fee.saturating_add(min_output));
            let refunded = refund > min_output;
            let mut outputs = vec![
                carrier,
                TxOut {
                    value: Amount::from_sat(min_output),
                    script_pubkey: destination_script.clone(),
                },
            ];
            if refunded {
                outputs.push(TxOut {
                    value: Amount::from_sat(refund),
                    script_pubkey: funding_script.clone(),
                });
            }
            let tx = link_transaction(parent_output, outputs);
            let txid = tx.compute_txid();
            let refund_output = refunded
                .then(|| UnspentOutput::local(OutPoint::new(txid, CONTINUATION_VOUT + 1), refund));

            TransactionLink {
                index,
                parent_output,
                prevout: prevout.clone(),
                unsigned_tx: tx,
                signed_hex: None,
                resulting_txid: txid,
                change_output: None,
                refund_output,
                payload_range: range,
                fee_sat: if refunded {
                    refund_fee
                } else {
                    parent_value - min_output
                },
            }
        };

        debug!(
            link = index,
            txid = %link.resulting_txid,
            parent = %link.parent_output,
            fee_sat = link.fee_sat,
            "built chain link"
        );
        if let Some(change) = &link.change_output {
            parent_output = change.outpoint;
        }
        links.push(link);
    }

    info!(
        links = links.len(),
        payloads = payloads.len(),
        funding = %funding.outpoint,
        funding_sat = funding.value_sat,
        "built transaction chain"
    );
    Ok(links)
}

/// Parse `destination` and check it belongs to `network`.
pub fn destination_script(destination: &str, network: BtcNetwork) -> Result<ScriptBuf, EngineError> {
    let address = Address::<NetworkUnchecked>::from_str(destination.trim())
        .map_err(|e| EngineError::InvalidAddress(format!("invalid destination address: {e}")))?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| EngineError::InvalidAddress(format!("destination address wrong network: {e}")))?;
    Ok(address.script_pubkey())
}

fn link_transaction(parent: OutPoint, output: Vec<TxOut>) -> Transaction {
    debug_assert!(output[DATA_CARRIER_VOUT].script_pubkey.is_op_return());
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: parent,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        }],
        output,
    }
}
