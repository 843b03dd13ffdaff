//! AES-256-CBC with PKCS7 padding.
//!
//! The IV is passed explicitly and is not part of the returned ciphertext;
//! [`crate::seal`] is responsible for framing it.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const BLOCK_LEN: usize = 16;

#[must_use]
pub fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt and strip padding.
///
/// Misaligned or empty input fails with [`CryptoError::DecryptionFailed`];
/// malformed padding with [`CryptoError::InvalidPadding`].
pub fn aes256_cbc_decrypt(
    key: &[u8; 32],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::DecryptionFailed);
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nist_sp800_38a_first_block() {
        // F.2.5 CBC-AES256.Encrypt, block #1; the second output block is the
        // encrypted PKCS7 padding and is ignored here.
        let key: [u8; 32] =
            hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
                .unwrap()
                .try_into()
                .unwrap();
        let iv: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let ciphertext = aes256_cbc_encrypt(&key, &iv, &plaintext);
        assert_eq!(ciphertext.len(), 32);
        assert_eq!(hex::encode(&ciphertext[..16]), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
        assert_eq!(aes256_cbc_decrypt(&key, &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn misaligned_input_fails() {
        let key = [0x42; 32];
        let iv = [0x24; 16];
        for len in [0, 1, 15, 17] {
            assert_eq!(
                aes256_cbc_decrypt(&key, &iv, &vec![0u8; len]),
                Err(CryptoError::DecryptionFailed),
                "len {len}"
            );
        }
    }

    #[test]
    fn corrupted_padding_is_reported() {
        let key = [0x42; 32];
        let iv = [0x24; 16];
        let mut ct = aes256_cbc_encrypt(&key, &iv, b"bitflip test data");
        let last = ct.len() - 16;
        ct[last] ^= 0x01;
        assert_eq!(aes256_cbc_decrypt(&key, &iv, &ct), Err(CryptoError::InvalidPadding));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn ciphertext_is_block_aligned_and_decrypts(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let ciphertext = aes256_cbc_encrypt(&key, &iv, &plaintext);
            prop_assert_eq!(ciphertext.len() % BLOCK_LEN, 0);
            prop_assert!(ciphertext.len() > plaintext.len());
            prop_assert_eq!(aes256_cbc_decrypt(&key, &iv, &ciphertext).unwrap(), plaintext);
        }
    }
}
