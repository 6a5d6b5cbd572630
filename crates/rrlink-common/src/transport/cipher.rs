//! Versioned payload ciphers.
//!
//! The frame header carries a 3-byte version tag; each version selects a
//! [`PayloadCipher`] that knows how to derive the per-frame key and
//! encrypt/decrypt the payload.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use md5::{Digest, Md5};

use crate::protocol::error::{Result, RrError};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

/// Salt mixed into the V1 key derivation.
const V1_SALT: &str = "TXdfu$jyZ#TZHsg4";

/// Character order used to scramble the timestamp hex string.
const V1_TIMESTAMP_ORDER: [usize; 8] = [5, 6, 3, 7, 1, 2, 0, 4];

/// Encrypts and decrypts frame payloads for one protocol version.
pub trait PayloadCipher: Send + Sync + 'static {
    /// Version tag written to the first three header bytes.
    fn version(&self) -> &'static [u8; 3];

    fn encrypt(&self, plaintext: &[u8], local_key: &str, timestamp: u32) -> Result<Vec<u8>>;

    /// Must fail (never return garbage) when the key does not match.
    fn decrypt(&self, ciphertext: &[u8], local_key: &str, timestamp: u32) -> Result<Vec<u8>>;
}

/// Version `1.0`: AES-128-ECB with PKCS#7 padding.
///
/// The key is `MD5(scrambled_hex(timestamp) || local_key || salt)`, so every
/// frame timestamp yields a different key.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Cipher;

impl V1Cipher {
    pub fn derive_key(local_key: &str, timestamp: u32) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(encode_timestamp(timestamp).as_bytes());
        hasher.update(local_key.as_bytes());
        hasher.update(V1_SALT.as_bytes());

        let mut key = [0u8; 16];
        key.copy_from_slice(&hasher.finalize());
        key
    }
}

impl PayloadCipher for V1Cipher {
    fn version(&self) -> &'static [u8; 3] {
        b"1.0"
    }

    fn encrypt(&self, plaintext: &[u8], local_key: &str, timestamp: u32) -> Result<Vec<u8>> {
        let key = Self::derive_key(local_key, timestamp);
        let cipher = Aes128EcbEnc::new_from_slice(&key)
            .map_err(|e| RrError::InvalidRequest(format!("invalid cipher key: {}", e)))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8], local_key: &str, timestamp: u32) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(RrError::FrameCorrupt(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let key = Self::derive_key(local_key, timestamp);
        let cipher = Aes128EcbDec::new_from_slice(&key)
            .map_err(|e| RrError::InvalidRequest(format!("invalid cipher key: {}", e)))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| RrError::FrameCorrupt("payload decryption failed".to_string()))
    }
}

fn encode_timestamp(timestamp: u32) -> String {
    let hex = format!("{:08x}", timestamp);
    let bytes = hex.as_bytes();
    V1_TIMESTAMP_ORDER
        .iter()
        .map(|&idx| bytes[idx] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_timestamp_scrambles_hex() {
        // 0x12345678 -> "12345678" -> indices [5,6,3,7,1,2,0,4]
        assert_eq!(encode_timestamp(0x1234_5678), "67482315");
        assert_eq!(encode_timestamp(0), "00000000");
    }

    #[test]
    fn test_key_depends_on_timestamp_and_key() {
        let a = V1Cipher::derive_key("local-key-0001", 1);
        let b = V1Cipher::derive_key("local-key-0001", 2);
        let c = V1Cipher::derive_key("local-key-0002", 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = V1Cipher;
        let ct = cipher.encrypt(b"hello device", "abcdefgh12345678", 1000).unwrap();
        assert_eq!(ct.len() % 16, 0);
        let pt = cipher.decrypt(&ct, "abcdefgh12345678", 1000).unwrap();
        assert_eq!(pt, b"hello device");
    }

    #[test]
    fn test_decrypt_rejects_misaligned_input() {
        let err = V1Cipher.decrypt(&[0u8; 15], "k", 1).unwrap_err();
        assert!(matches!(err, RrError::FrameCorrupt(_)));
    }
}
