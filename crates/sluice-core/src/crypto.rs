//! File encryption and content digests.
//!
//! Every blob is encrypted with a key derived from the channel's encryption
//! secret and the blob's destination path:
//!
//! ```text
//! key = SHA-256(base64_decode(channel_key) || path)
//! iv  = [0u8; 8] || diversifier.to_be_bytes()
//! ciphertext = AES-256-CTR(key, iv, zero_pad(plaintext))
//! ```
//!
//! Digests are MD5, reported hex-encoded to the control plane.

use crate::error::CryptoError;
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::Md5;
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Length of `len` bytes after padding to `block_size`.
///
/// At least one byte of padding is always added, so an already aligned
/// length grows by a whole block.
pub fn padded_len(len: usize, block_size: usize) -> usize {
    len + (block_size - len % block_size)
}

/// Zero-pad a buffer in place to the next block boundary.
pub fn pad_buffer(buf: &mut Vec<u8>, block_size: usize) {
    let target = padded_len(buf.len(), block_size);
    buf.resize(target, 0);
}

/// Derive the per-file key from the channel key and destination path.
pub fn derive_key(encoded_key: &str, path: &str) -> Result<[u8; 32], CryptoError> {
    let secret = STANDARD
        .decode(encoded_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&secret);
    hasher.update(path.as_bytes());
    Ok(hasher.finalize().into())
}

fn build_iv(diversifier: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&diversifier.to_be_bytes());
    iv
}

fn apply_keystream(
    data: &mut [u8],
    encoded_key: &str,
    path: &str,
    diversifier: u64,
) -> Result<(), CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(data.len()));
    }
    let key = derive_key(encoded_key, path)?;
    let iv = build_iv(diversifier);
    let mut cipher = Aes256Ctr::new_from_slices(&key, &iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Encrypt padded plaintext in place.
pub fn encrypt(
    data: &mut [u8],
    encoded_key: &str,
    path: &str,
    diversifier: u64,
) -> Result<(), CryptoError> {
    apply_keystream(data, encoded_key, path, diversifier)
}

/// Decrypt ciphertext in place. Padding is left in the output.
pub fn decrypt(
    data: &mut [u8],
    encoded_key: &str,
    path: &str,
    diversifier: u64,
) -> Result<(), CryptoError> {
    apply_keystream(data, encoded_key, path, diversifier)
}

/// MD5 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    /// Digest the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "c2x1aWNlLXRlc3Qta2V5LW1hdGVyaWFsLTMyLWJ5dGVz";

    #[test]
    fn test_pad_buffer() {
        let mut buf = vec![1u8; 10];
        pad_buffer(&mut buf, BLOCK_SIZE);
        assert_eq!(buf.len(), 16);
        assert!(buf[10..].iter().all(|b| *b == 0));

        let mut aligned = vec![1u8; 32];
        pad_buffer(&mut aligned, BLOCK_SIZE);
        assert_eq!(aligned.len(), 48);

        let mut empty = Vec::new();
        pad_buffer(&mut empty, BLOCK_SIZE);
        assert_eq!(empty.len(), 16);
    }

    #[test]
    fn test_key_depends_on_path() {
        let a = derive_key(KEY, "2024/1/1/0/0/abc.bdec").unwrap();
        let b = derive_key(KEY, "2024/1/1/0/0/abd.bdec").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key() {
        let err = derive_key("not base64!!", "p").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }

    #[test]
    fn test_unpadded_input_rejected() {
        let mut data = vec![0u8; 15];
        let err = encrypt(&mut data, KEY, "p", 0).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidLength(15)));
    }

    #[test]
    fn test_encrypt_changes_bytes() {
        let mut data = b"PAR1 hello parquet".to_vec();
        pad_buffer(&mut data, BLOCK_SIZE);
        let original = data.clone();
        encrypt(&mut data, KEY, "a/b.bdec", 0).unwrap();
        assert_ne!(data, original);

        let mut other = original.clone();
        encrypt(&mut other, KEY, "a/b.bdec", 1).unwrap();
        assert_ne!(data, other, "diversifier must change the keystream");
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(
            ContentDigest::of(b"").to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(ContentDigest::of(b"abc").as_bytes().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_encrypt_decrypt_round_trip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            path in "[a-z0-9/]{1,40}",
            diversifier in any::<u64>(),
        ) {
            let mut data = plaintext.clone();
            pad_buffer(&mut data, BLOCK_SIZE);
            encrypt(&mut data, KEY, &path, diversifier).unwrap();
            decrypt(&mut data, KEY, &path, diversifier).unwrap();

            prop_assert_eq!(&data[..plaintext.len()], &plaintext[..]);
            prop_assert!(data[plaintext.len()..].iter().all(|b| *b == 0));
            prop_assert!(data.len() > plaintext.len());
        }
    }
}
