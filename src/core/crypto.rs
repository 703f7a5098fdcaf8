//! AES-256-CBC decryption of control-plane envelopes.
//!
//! The certificate endpoint returns the bundle encrypted with the device's
//! pre-shared key; IV and ciphertext travel hex encoded. PKCS#7 padding is
//! stripped by reading the last byte as the pad length.

use std::fmt;

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use thiserror::Error;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum DecryptionError {
    #[error("{field} is not valid hex: {source}")]
    InvalidHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("Key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("IV must be 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("Ciphertext length {0} is not a positive multiple of 16")]
    InvalidCiphertextLength(usize),

    #[error("Invalid padding")]
    InvalidPadding,
}

/// Encrypted payload as received from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub transaction_id: String,
    pub iv_hex: String,
    pub ciphertext_hex: String,
}

/// Holds the decoded device key.
#[derive(Clone)]
pub struct Decryptor {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decryptor").finish_non_exhaustive()
    }
}

impl Decryptor {
    pub fn from_hex(key_hex: &str) -> Result<Self, DecryptionError> {
        let bytes = decode("key", key_hex)?;
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecryptionError::InvalidKeyLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Decrypts and unpads the envelope.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, DecryptionError> {
        let iv = decode("iv", &envelope.iv_hex)?;
        if iv.len() != BLOCK_LEN {
            return Err(DecryptionError::InvalidIvLength(iv.len()));
        }

        let mut buf = decode("ciphertext", &envelope.ciphertext_hex)?;
        if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
            return Err(DecryptionError::InvalidCiphertextLength(buf.len()));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|_| DecryptionError::InvalidIvLength(iv.len()))?;
        let total = buf.len();
        let len = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| DecryptionError::InvalidCiphertextLength(total))?
            .len();
        buf.truncate(len);

        strip_pkcs7(&mut buf)?;
        Ok(buf)
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, DecryptionError> {
    hex::decode(value.trim()).map_err(|source| DecryptionError::InvalidHex { field, source })
}

// A pad length larger than the buffer is rejected rather than sliced.
fn strip_pkcs7(buf: &mut Vec<u8>) -> Result<(), DecryptionError> {
    let pad = *buf.last().ok_or(DecryptionError::InvalidPadding)? as usize;
    if pad > buf.len() {
        return Err(DecryptionError::InvalidPadding);
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut};

    use super::*;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    pub(crate) const KEY_HEX: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    pub(crate) const IV_HEX: &str = "a0a1a2a3a4a5a6a7a8a9aaabacadaeaf";

    /// Encrypts `plaintext` the way the control plane does.
    pub(crate) fn seal(plaintext: &[u8], key_hex: &str, iv_hex: &str) -> EncryptedEnvelope {
        let key = hex::decode(key_hex).unwrap();
        let iv = hex::decode(iv_hex).unwrap();
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        EncryptedEnvelope {
            transaction_id: "tx-1".into(),
            iv_hex: iv_hex.into(),
            ciphertext_hex: hex::encode(ciphertext),
        }
    }

    fn decryptor() -> Decryptor {
        Decryptor::from_hex(KEY_HEX).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let plaintext = br#"{"deviceId":"dev-1","certificatePem":"-----BEGIN CERTIFICATE-----"}"#;
        let envelope = seal(plaintext, KEY_HEX, IV_HEX);
        assert_eq!(decryptor().decrypt(&envelope).unwrap(), plaintext);
    }

    #[test]
    fn test_block_aligned_plaintext_gets_full_pad_block() {
        let plaintext = [7u8; 32];
        let envelope = seal(&plaintext, KEY_HEX, IV_HEX);
        assert_eq!(envelope.ciphertext_hex.len(), 96);
        assert_eq!(decryptor().decrypt(&envelope).unwrap(), plaintext);
    }

    #[test]
    fn test_pad_longer_than_buffer_is_rejected() {
        // one block whose final byte decrypts to 0xff
        let mut block = [0u8; BLOCK_LEN];
        block[BLOCK_LEN - 1] = 0xff;
        let key = hex::decode(KEY_HEX).unwrap();
        let iv = hex::decode(IV_HEX).unwrap();
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(&block);
        let envelope = EncryptedEnvelope {
            transaction_id: "tx-1".into(),
            iv_hex: IV_HEX.into(),
            ciphertext_hex: hex::encode(ciphertext),
        };

        assert_eq!(
            decryptor().decrypt(&envelope),
            Err(DecryptionError::InvalidPadding)
        );
    }

    #[test]
    fn test_short_key_rejected() {
        assert_eq!(
            Decryptor::from_hex("abcd").unwrap_err(),
            DecryptionError::InvalidKeyLength(2)
        );
    }

    #[test]
    fn test_bad_hex_reports_field() {
        let mut envelope = seal(b"x", KEY_HEX, IV_HEX);
        envelope.iv_hex = "not hex".into();
        assert!(matches!(
            decryptor().decrypt(&envelope),
            Err(DecryptionError::InvalidHex { field: "iv", .. })
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let mut envelope = seal(b"hello", KEY_HEX, IV_HEX);
        envelope.ciphertext_hex.truncate(30);
        assert_eq!(
            decryptor().decrypt(&envelope),
            Err(DecryptionError::InvalidCiphertextLength(15))
        );
    }

    #[test]
    fn test_wrong_iv_length() {
        let mut envelope = seal(b"hello", KEY_HEX, IV_HEX);
        envelope.iv_hex = "a0a1".into();
        assert_eq!(
            decryptor().decrypt(&envelope),
            Err(DecryptionError::InvalidIvLength(2))
        );
    }
}
