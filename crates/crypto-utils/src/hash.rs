use sha2::{Digest, Sha256};

/// Tag used by BIP-341 to derive the key-path tweak.
pub const TAP_TWEAK_TAG: &str = "TapTweak";

/// Single SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// BIP-340 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// The BIP-341 key-path-only tweak for a 32-byte x-only internal key.
pub fn tap_tweak(xonly_internal_key: &[u8; 32]) -> [u8; 32] {
    tagged_hash(TAP_TWEAK_TAG, xonly_internal_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn sha256_empty_input() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn tagged_hash_matches_manual_construction() {
        let tag_hash = sha256(b"TapTweak");
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&tag_hash);
        preimage.extend_from_slice(&tag_hash);
        preimage.extend_from_slice(b"payload");

        assert_eq!(tagged_hash("TapTweak", b"payload"), sha256(&preimage));
    }

    #[test]
    fn different_tags_produce_different_digests() {
        assert_ne!(tagged_hash("TapTweak", b"x"), tagged_hash("TapLeaf", b"x"));
    }

    /// BIP-341 wallet test vector: key-path-only output, no script tree.
    #[test]
    fn tap_tweak_bip341_vector() {
        let internal = decode32("d6889cb081036e0faefa3a35157ad71086b123b2b144b649798b494c300a961d");
        assert_eq!(
            hex::encode(tap_tweak(&internal)),
            "b86e7be8f39bab32a6f2c0443abbc210f0edac0e2c53d501b36b64437d9c6c70"
        );
    }
}
