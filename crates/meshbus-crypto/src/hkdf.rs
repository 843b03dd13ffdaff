//! HKDF-SHA256 (RFC 5869).
//!
//! Built directly on [`crate::hmac::hmac_sha256`]. A missing or empty salt is
//! replaced by 32 zero bytes, and the output length is capped at 255 blocks.

use zeroize::Zeroizing;

use crate::CryptoError;
use crate::hmac::hmac_sha256;

const HASH_LEN: usize = 32;

/// Largest output `hkdf_expand` will produce.
pub const MAX_OUTPUT_LEN: usize = 255 * HASH_LEN;

/// Extract step: `PRK = HMAC-SHA256(salt, ikm)`.
pub fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8]) -> Zeroizing<[u8; 32]> {
    let salt: &[u8] = match salt {
        Some(s) if !s.is_empty() => s,
        _ => &[0u8; HASH_LEN],
    };
    Zeroizing::new(hmac_sha256(salt, ikm))
}

/// Expand step: `T(i) = HMAC(PRK, T(i-1) || info || i)`.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], length: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length > MAX_OUTPUT_LEN {
        return Err(CryptoError::InvalidLength {
            reason: "HKDF output longer than 255 hash blocks",
        });
    }

    let mut okm = Zeroizing::new(Vec::with_capacity(length.next_multiple_of(HASH_LEN)));
    let mut block = Zeroizing::new(Vec::new());
    let mut counter = 1u8;
    while okm.len() < length {
        let mut input = Zeroizing::new(Vec::with_capacity(block.len() + info.len() + 1));
        input.extend_from_slice(&block);
        input.extend_from_slice(info);
        input.push(counter);

        let output = hmac_sha256(prk, &input);
        block.clear();
        block.extend_from_slice(&output);
        okm.extend_from_slice(&output);
        counter = counter.wrapping_add(1);
    }

    okm.truncate(length);
    Ok(okm)
}

/// Extract then expand.
pub fn hkdf(
    length: usize,
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info.unwrap_or(b""), length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc5869_case_1() {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let prk = hkdf_extract(Some(&salt), &ikm);
        assert_eq!(
            hex::encode(*prk),
            "077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5"
        );

        let okm = hkdf(42, &ikm, Some(&salt), Some(&info)).unwrap();
        assert_eq!(
            hex::encode(&*okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn none_and_empty_salt_agree() {
        let a = hkdf(64, b"ikm", None, Some(b"ctx")).unwrap();
        let b = hkdf(64, b"ikm", Some(&[]), Some(b"ctx")).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn info_separates_outputs() {
        let a = hkdf(32, b"ikm", None, Some(b"one")).unwrap();
        let b = hkdf(32, b"ikm", None, Some(b"two")).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn zero_length_output() {
        assert!(hkdf(0, b"zero", None, None).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_output() {
        assert!(matches!(
            hkdf(MAX_OUTPUT_LEN + 1, b"too much", None, None),
            Err(CryptoError::InvalidLength { .. })
        ));
        assert_eq!(hkdf(MAX_OUTPUT_LEN, b"max", None, None).unwrap().len(), MAX_OUTPUT_LEN);
    }
}
