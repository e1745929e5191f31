//! Hybrid public-key encryption for hub clipboard payloads
//!
//! A fresh AES-256-GCM key seals the plaintext and is itself wrapped with
//! RSA-OAEP (SHA-1) for the recipient. The output is four length-prefixed
//! blocks, each a big-endian u32 length followed by the bytes:
//!
//! ```text
//! [wrapped key][iv][tag][ciphertext]
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bytes::{Buf, BufMut};
use rand::{rngs::OsRng, RngCore};
use rsa::Oaep;
use sha1::Sha1;

use super::keys::{PrivateKey, PublicKey};
use crate::{Error, Result};

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypt `plaintext` so only the holder of `recipient`'s private key can read it
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Crypto(format!("invalid content key: {}", e)))?;
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;
    // aes-gcm appends the tag to the ciphertext
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    let wrapped_key = recipient
        .rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &key)
        .map_err(|e| Error::Crypto(format!("key wrap failed: {}", e)))?;

    let blocks: [&[u8]; 4] = [&wrapped_key, &iv, &tag, &ciphertext];
    let total: usize = blocks.iter().map(|b| 4 + b.len()).sum();
    let mut out = Vec::with_capacity(total);
    for block in blocks {
        out.put_u32(block.len() as u32);
        out.put_slice(block);
    }
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`] with the recipient's private key
pub fn decrypt(data: &[u8], key: &PrivateKey) -> Result<Vec<u8>> {
    let mut reader = data;
    let wrapped_key = read_block(&mut reader, "wrapped key")?;
    let iv = read_block(&mut reader, "iv")?;
    let tag = read_block(&mut reader, "tag")?;
    let ciphertext = read_block(&mut reader, "ciphertext")?;
    if !reader.is_empty() {
        return Err(Error::Crypto(format!(
            "{} trailing bytes after ciphertext",
            reader.len()
        )));
    }
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(Error::Crypto("invalid iv or tag length".to_string()));
    }

    let content_key = key
        .rsa()
        .decrypt(Oaep::new::<Sha1>(), wrapped_key)
        .map_err(|e| Error::Crypto(format!("key unwrap failed: {}", e)))?;
    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|_| Error::Crypto("unwrapped key has wrong length".to_string()))?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_ref())
        .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
}

fn read_block<'a>(reader: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if reader.remaining() < 4 {
        return Err(Error::Crypto(format!("truncated {} length", what)));
    }
    let len = reader.get_u32() as usize;
    if len > reader.len() {
        return Err(Error::Crypto(format!(
            "{} length {} overruns input of {} bytes",
            what,
            len,
            reader.len()
        )));
    }
    let (block, rest) = reader.split_at(len);
    *reader = rest;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;

    fn block_offsets(data: &[u8]) -> Vec<(usize, usize)> {
        let mut offsets = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            offsets.push((pos + 4, len));
            pos += 4 + len;
        }
        offsets
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = fixtures::key_a();
        let sealed = encrypt(b"Hello, World!", &key.public_key()).unwrap();
        assert_eq!(decrypt(&sealed, key).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_empty_plaintext() {
        let key = fixtures::key_a();
        let sealed = encrypt(b"", &key.public_key()).unwrap();
        assert!(decrypt(&sealed, key).unwrap().is_empty());
    }

    #[test]
    fn test_layout() {
        let key = fixtures::key_a();
        let sealed = encrypt(b"abc", &key.public_key()).unwrap();
        let blocks = block_offsets(&sealed);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].1, 256);
        assert_eq!(blocks[1].1, IV_LEN);
        assert_eq!(blocks[2].1, TAG_LEN);
        assert_eq!(blocks[3].1, 3);
    }

    #[test]
    fn test_randomized() {
        let public = fixtures::key_a().public_key();
        assert_ne!(encrypt(b"same", &public).unwrap(), encrypt(b"same", &public).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(b"secret", &fixtures::key_a().public_key()).unwrap();
        assert!(decrypt(&sealed, fixtures::key_b()).is_err());
    }

    #[test]
    fn test_tampering_any_block_fails() {
        let key = fixtures::key_a();
        let sealed = encrypt(b"tamper me", &key.public_key()).unwrap();

        for (start, len) in block_offsets(&sealed) {
            let mut corrupted = sealed.clone();
            corrupted[start + len / 2] ^= 0x01;
            assert!(decrypt(&corrupted, key).is_err());
        }
    }

    #[test]
    fn test_truncation_and_trailing_bytes_fail() {
        let key = fixtures::key_a();
        let sealed = encrypt(b"x", &key.public_key()).unwrap();

        assert!(decrypt(&sealed[..sealed.len() - 1], key).is_err());
        assert!(decrypt(&sealed[..2], key).is_err());

        let mut extended = sealed.clone();
        extended.push(0);
        assert!(decrypt(&extended, key).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_fails() {
        let key = fixtures::key_a();
        let mut sealed = encrypt(b"x", &key.public_key()).unwrap();
        sealed[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decrypt(&sealed, key).is_err());
    }
}
