use rand::RngCore;
use rand_core::OsRng;

use crate::error::CryptoError;

/// Generates a fixed-size array of cryptographically secure random bytes.
pub fn random_bytes_fixed<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Draws random arrays until `accept` returns `true`, up to `max_attempts`.
///
/// Used for rejection sampling of secret scalars, where a tiny fraction of
/// 32-byte strings (zero, or values at or above the curve order) are invalid.
pub fn random_bytes_accepted<const N: usize>(
    max_attempts: usize,
    accept: impl Fn(&[u8; N]) -> bool,
) -> Result<[u8; N], CryptoError> {
    if max_attempts == 0 {
        return Err(CryptoError::InvalidInput(
            "max_attempts must be at least 1".into(),
        ));
    }

    for _ in 0..max_attempts {
        let candidate = random_bytes_fixed::<N>();
        if accept(&candidate) {
            return Ok(candidate);
        }
    }

    Err(CryptoError::RandomnessExhausted(max_attempts))
}
