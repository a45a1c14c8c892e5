//! AES-256-CTR stream codec
//!
//! Output layout: `[16 bytes: IV] [ciphertext...]`. Counter mode turns the
//! block cipher into a keystream, so the same transform both encrypts and
//! decrypts. There is no authentication tag.

use super::CryptoError;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use std::io::{self, Read, Write};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block width, also the size of the IV prefix
pub const BLOCK_SIZE: usize = 16;

/// Bytes processed per read
pub const CHUNK_SIZE: usize = 32 * 1024;

fn new_cipher(key: &[u8], iv: &[u8; BLOCK_SIZE]) -> Result<Aes256Ctr, CryptoError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

/// Encrypt `src` into `dst` under a fresh random IV.
///
/// Returns the number of bytes written, IV prefix included.
pub fn copy_encrypt<R: Read, W: Write>(
    key: &[u8],
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv)?;
    copy_stream(&mut cipher, src, dst)
}

/// Read the IV prefix from `src` and decrypt the remainder into `dst`.
///
/// Returns the number of bytes consumed from `src`, IV prefix included.
/// A source shorter than the prefix fails with `UnexpectedEof`.
pub fn copy_decrypt<R: Read, W: Write>(
    key: &[u8],
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError> {
    // Reject a bad key before touching the source
    new_cipher(key, &[0u8; BLOCK_SIZE])?;

    let mut iv = [0u8; BLOCK_SIZE];
    src.read_exact(&mut iv)?;
    let mut cipher = new_cipher(key, &iv)?;

    copy_stream(&mut cipher, src, dst)
}

fn copy_stream<R: Read, W: Write>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = BLOCK_SIZE as u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }

    dst.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let payload = b"Foo not bar";

        let mut encrypted = Vec::new();
        let n = copy_encrypt(key.as_bytes(), &mut &payload[..], &mut encrypted).unwrap();
        assert_eq!(n as usize, BLOCK_SIZE + payload.len());
        assert_eq!(encrypted.len(), BLOCK_SIZE + payload.len());
        assert_ne!(&encrypted[BLOCK_SIZE..], payload);

        let mut decrypted = Vec::new();
        let n = copy_decrypt(key.as_bytes(), &mut encrypted.as_slice(), &mut decrypted).unwrap();
        assert_eq!(n as usize, BLOCK_SIZE + payload.len());
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_multi_chunk_roundtrip() {
        let key = EncryptionKey::generate();
        let payload: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();

        let mut encrypted = Vec::new();
        copy_encrypt(key.as_bytes(), &mut payload.as_slice(), &mut encrypted).unwrap();

        let mut decrypted = Vec::new();
        copy_decrypt(key.as_bytes(), &mut encrypted.as_slice(), &mut decrypted).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = EncryptionKey::generate();
        let mut a = Vec::new();
        let mut b = Vec::new();
        copy_encrypt(key.as_bytes(), &mut &b"same"[..], &mut a).unwrap();
        copy_encrypt(key.as_bytes(), &mut &b"same"[..], &mut b).unwrap();
        assert_ne!(a[..BLOCK_SIZE], b[..BLOCK_SIZE]);
    }

    #[test]
    fn test_empty_payload() {
        let key = EncryptionKey::generate();
        let mut encrypted = Vec::new();
        copy_encrypt(key.as_bytes(), &mut io::empty(), &mut encrypted).unwrap();
        assert_eq!(encrypted.len(), BLOCK_SIZE);

        let mut decrypted = Vec::new();
        copy_decrypt(key.as_bytes(), &mut encrypted.as_slice(), &mut decrypted).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        let mut out = Vec::new();
        let result = copy_encrypt(&[0u8; 7], &mut &b"data"[..], &mut out);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength(7))));
        assert!(out.is_empty());

        let result = copy_decrypt(&[0u8; 7], &mut &[0u8; 32][..], &mut out);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength(7))));
    }

    #[test]
    fn test_truncated_prefix() {
        let key = EncryptionKey::generate();
        let mut out = Vec::new();
        let result = copy_decrypt(key.as_bytes(), &mut &[1u8, 2, 3][..], &mut out);
        match result {
            Err(CryptoError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_garbles() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();

        let mut encrypted = Vec::new();
        copy_encrypt(key1.as_bytes(), &mut &b"secret payload"[..], &mut encrypted).unwrap();

        let mut decrypted = Vec::new();
        copy_decrypt(key2.as_bytes(), &mut encrypted.as_slice(), &mut decrypted).unwrap();
        assert_ne!(decrypted, b"secret payload");
    }
}
