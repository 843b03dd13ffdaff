//! HMAC-SHA256 message authentication.

use crate::CryptoError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the HMAC-SHA256 of `data` using the given `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length; `new_from_slice` cannot fail here.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify that the HMAC-SHA256 of `data` under `key` matches `expected`.
///
/// The comparison is constant time.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| CryptoError::InvalidHmac)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    const JEFE_DIGEST: &str = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";

    #[test]
    fn rfc4231_case_2() {
        let digest = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex::encode(digest), JEFE_DIGEST);
    }

    #[test]
    fn verify_accepts_matching_mac() {
        let expected = hex::decode(JEFE_DIGEST).unwrap();
        hmac_sha256_verify(b"Jefe", b"what do ya want for nothing?", &expected).unwrap();
    }

    #[test]
    fn verify_rejects_flipped_byte() {
        let mut digest = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        digest[0] ^= 0xff;
        assert_eq!(
            hmac_sha256_verify(b"Jefe", b"what do ya want for nothing?", &digest),
            Err(CryptoError::InvalidHmac)
        );
    }

    #[test]
    fn verify_rejects_truncated_mac() {
        let digest = hmac_sha256(&[0xCC; 32], b"data");
        assert_eq!(
            hmac_sha256_verify(&[0xCC; 32], b"data", &digest[..16]),
            Err(CryptoError::InvalidHmac)
        );
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let mac = hmac_sha256(&[0xAA; 32], b"test data");
        assert_eq!(
            hmac_sha256_verify(&[0xBB; 32], b"test data", &mac),
            Err(CryptoError::InvalidHmac)
        );
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn hmac_verify_roundtrip(
            key in proptest::collection::vec(any::<u8>(), 1..128),
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mac = hmac_sha256(&key, &data);
            prop_assert!(hmac_sha256_verify(&key, &data, &mac).is_ok());
        }
    }
}
