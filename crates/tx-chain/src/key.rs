use std::fmt;

use bitcoin::address::Address;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Scalar, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{PrivateKey, Transaction, TxOut, Witness};
use crypto_utils::hash::tap_tweak;
use crypto_utils::random::random_bytes_accepted;
use crypto_utils::zeroizing::ZeroizingString;

use crate::error::EngineError;
use crate::network::BtcNetwork;

/// SEC1 prefix of a compressed public key with an odd Y coordinate.
const ODD_Y_PREFIX: u8 = 0x03;

/// Rejection-sampling budget for ephemeral secrets. An out-of-range draw has
/// probability ~2^-128, so this is never reached in practice.
const EPHEMERAL_KEY_ATTEMPTS: usize = 16;

/// A Taproot key-path signing key.
///
/// Holds the tweaked keypair used for BIP-340 signatures together with the
/// single-key output script and address it controls. Immutable once derived.
pub struct SigningKey {
    secret: ZeroizingString,
    network: BtcNetwork,
    keypair: Keypair,
    internal_key: XOnlyPublicKey,
    output_key: TweakedPublicKey,
    script_pubkey: ScriptBuf,
    address: Address,
}

impl SigningKey {
    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    /// The untweaked x-only key (after even-Y normalization).
    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    /// The tweaked x-only key committed to in the output script.
    pub fn output_key(&self) -> XOnlyPublicKey {
        self.output_key.to_inner()
    }

    /// `OP_1 <32-byte output key>`.
    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// WIF encoding of the untweaked secret, e.g. for backing up an ephemeral
    /// key before funding its address.
    pub fn export_wif(&self) -> &str {
        self.secret.expose()
    }

    /// Sign every input of `tx` as a Taproot key-path spend.
    ///
    /// `prevouts` must list the outputs being spent in input order; BIP-341
    /// sighashes commit to all of them. Returns the transaction with
    /// single-element witnesses filled in.
    pub fn sign_key_path(
        &self,
        tx: &Transaction,
        prevouts: &[TxOut],
    ) -> Result<Transaction, EngineError> {
        if prevouts.len() != tx.input.len() {
            return Err(EngineError::SignFailed(format!(
                "{} prevouts supplied for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }

        let secp = Secp256k1::new();
        let prevouts = Prevouts::All(prevouts);
        let mut signed_tx = tx.clone();

        for input_index in 0..tx.input.len() {
            let mut sighash_cache = SighashCache::new(tx);
            let sighash = sighash_cache
                .taproot_key_spend_signature_hash(input_index, &prevouts, TapSighashType::Default)
                .map_err(|e| EngineError::SignFailed(format!("sighash computation failed: {e}")))?;

            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr(&msg, &self.keypair);

            let tap_sig = bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            };
            signed_tx.input[input_index].witness = Witness::p2tr_key_spend(&tap_sig);
        }

        Ok(signed_tx)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("network", &self.network)
            .field("internal_key", &self.internal_key)
            .field("output_key", &self.output_key)
            .field("address", &self.address.to_string())
            .finish_non_exhaustive()
    }
}

/// Derive a Taproot key-path signing key from a WIF-encoded secret.
///
/// Fails with `InvalidSecret` if the WIF does not decode or was encoded for a
/// different network family than `network`.
pub fn derive_signing_key(wif: &str, network: BtcNetwork) -> Result<SigningKey, EngineError> {
    let private_key = PrivateKey::from_wif(wif.trim())
        .map_err(|e| EngineError::InvalidSecret(format!("failed to decode WIF: {e}")))?;

    if private_key.network != network.kind() {
        return Err(EngineError::InvalidSecret(format!(
            "WIF encoded for {:?} network family, expected {network}",
            private_key.network
        )));
    }

    from_secret_key(private_key.inner, ZeroizingString::from(wif.trim()), network)
}

/// Generate a fresh random key for a single operation (e.g. one batch mint).
pub fn generate_ephemeral_key(network: BtcNetwork) -> Result<SigningKey, EngineError> {
    let bytes = random_bytes_accepted::<32>(EPHEMERAL_KEY_ATTEMPTS, |b| {
        SecretKey::from_slice(b).is_ok()
    })
    .map_err(|e| EngineError::InvalidSecret(format!("ephemeral secret generation: {e}")))?;

    let secret = SecretKey::from_slice(&bytes)
        .map_err(|e| EngineError::InvalidSecret(format!("invalid secret key: {e}")))?;
    let wif = PrivateKey::new(secret, network.kind()).to_wif();

    from_secret_key(secret, ZeroizingString::new(wif), network)
}

fn from_secret_key(
    secret: SecretKey,
    wif: ZeroizingString,
    network: BtcNetwork,
) -> Result<SigningKey, EngineError> {
    let secp = Secp256k1::new();

    // BIP-341 internal keys are x-only with implied even Y.
    let raw_public = PublicKey::from_secret_key(&secp, &secret);
    let secret = if raw_public.serialize()[0] == ODD_Y_PREFIX {
        secret.negate()
    } else {
        secret
    };
    let (internal_key, _) = PublicKey::from_secret_key(&secp, &secret).x_only_public_key();

    let tweak_bytes = tap_tweak(&internal_key.serialize());
    let tweak = Scalar::from_be_bytes(tweak_bytes)
        .map_err(|_| EngineError::InvalidTweak("tweak is not below the curve order".into()))?;
    let tweaked_secret = secret
        .add_tweak(&tweak)
        .map_err(|e| EngineError::InvalidTweak(format!("tweaked key is invalid: {e}")))?;

    let keypair = Keypair::from_secret_key(&secp, &tweaked_secret);
    let (output_xonly, _) = keypair.x_only_public_key();
    let output_key = TweakedPublicKey::dangerous_assume_tweaked(output_xonly);

    let script_pubkey = ScriptBuf::new_p2tr_tweaked(output_key);
    let address = Address::p2tr_tweaked(output_key, network.to_bitcoin_network());

    Ok(SigningKey {
        secret: wif,
        network,
        keypair,
        internal_key,
        output_key,
        script_pubkey,
        address,
    })
}
