//! Per-connection traffic protection.
//!
//! Once a peer is authenticated both sides hold the same 64-byte session key.
//! It is split into a MAC key (`key[..32]`) and an AES-256 key (`key[32..]`).
//!
//! ```text
//! sealed:  [IV: 16] || AES-256-CBC(PKCS7, plaintext) || [HMAC-SHA256: 32]
//! signed:  plaintext || [HMAC-SHA256: 32]
//! ```
//!
//! The MAC of a sealed frame covers `IV || ciphertext`.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::aes_cbc::{BLOCK_LEN, aes256_cbc_decrypt, aes256_cbc_encrypt};
use crate::hmac::{hmac_sha256, hmac_sha256_verify};

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

pub const SESSION_KEY_LEN: usize = 64;

pub struct SessionCipher {
    mac_key: Zeroizing<[u8; 32]>,
    enc_key: Zeroizing<[u8; 32]>,
}

impl SessionCipher {
    pub fn new(key: &[u8; SESSION_KEY_LEN]) -> Self {
        let mut mac_key = Zeroizing::new([0u8; 32]);
        let mut enc_key = Zeroizing::new([0u8; 32]);
        mac_key.copy_from_slice(&key[..32]);
        enc_key.copy_from_slice(&key[32..]);
        Self { mac_key, enc_key }
    }

    /// Build from derived key material of unchecked length.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; SESSION_KEY_LEN] =
            key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SESSION_KEY_LEN,
                actual: key.len(),
            })?;
        Ok(Self::new(key))
    }

    /// Encrypt and authenticate with a random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        self.seal_with_iv(plaintext, &iv)
    }

    pub fn seal_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_LEN]) -> Vec<u8> {
        let ciphertext = aes256_cbc_encrypt(&self.enc_key, iv, plaintext);
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
        out.extend_from_slice(iv);
        out.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(&*self.mac_key, &out);
        out.extend_from_slice(&mac);
        out
    }

    /// Verify the MAC, then decrypt.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < IV_LEN + BLOCK_LEN + MAC_LEN {
            return Err(CryptoError::InvalidLength {
                reason: "sealed frame shorter than IV, one block and MAC",
            });
        }
        let (signed, mac) = sealed.split_at(sealed.len() - MAC_LEN);
        hmac_sha256_verify(&*self.mac_key, signed, mac)?;

        let (iv, ciphertext) = signed.split_at(IV_LEN);
        let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::DecryptionFailed)?;
        aes256_cbc_decrypt(&self.enc_key, iv, ciphertext)
    }

    /// Append an integrity tag without encrypting.
    pub fn sign(&self, plaintext: &[u8]) -> Vec<u8> {
        let mac = hmac_sha256(&*self.mac_key, plaintext);
        let mut out = Vec::with_capacity(plaintext.len() + MAC_LEN);
        out.extend_from_slice(plaintext);
        out.extend_from_slice(&mac);
        out
    }

    /// Check the integrity tag and return the payload.
    pub fn verify(&self, signed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if signed.len() < MAC_LEN {
            return Err(CryptoError::InvalidLength {
                reason: "signed frame shorter than MAC",
            });
        }
        let (payload, mac) = signed.split_at(signed.len() - MAC_LEN);
        hmac_sha256_verify(&*self.mac_key, payload, mac)?;
        Ok(payload.to_vec())
    }
}

impl core::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}
