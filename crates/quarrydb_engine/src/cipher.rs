//! Record payload encryption for the reference engine.
//!
//! Keys of any length are accepted; the working AES-256-GCM key is
//! derived with HKDF-SHA256 from the raw key material, the store's
//! 16-byte KDF salt, and the page size. Each payload carries its own
//! random nonce, and the GCM tag authenticates the payload, so a wrong
//! key or tampered bytes fail verification rather than decode garbage.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of the derived AES-256 key in bytes.
const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;
/// Size of the key-derivation salt in bytes.
pub const KDF_SALT_SIZE: usize = 16;
/// Page size used for key derivation when none is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Errors from payload encryption or decryption.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The ciphertext failed authentication, usually a wrong key.
    #[error("payload authentication failed")]
    Authentication,
    /// The ciphertext is too short to contain a nonce.
    #[error("ciphertext too short")]
    Truncated,
}

fn derive_key(raw: &[u8], kdf_salt: &[u8; KDF_SALT_SIZE], page_size: u32) -> Zeroizing<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(kdf_salt), raw);
    let mut info = Vec::with_capacity(20);
    info.extend_from_slice(b"quarrydb.record.");
    info.extend_from_slice(&page_size.to_le_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    // Cannot fail for a 32-byte output with SHA-256.
    hk.expand(&info, okm.as_mut())
        .unwrap_or_else(|_| unreachable!("HKDF expand with 32-byte output"));
    okm
}

/// Encrypts a record payload. The result is `nonce || ciphertext`.
#[must_use]
pub fn encrypt_payload(
    raw_key: &[u8],
    kdf_salt: &[u8; KDF_SALT_SIZE],
    page_size: u32,
    plaintext: &[u8],
) -> Vec<u8> {
    let key = derive_key(raw_key, kdf_salt, page_size);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .unwrap_or_else(|_| unreachable!("AES-GCM encryption is infallible for in-memory data"));
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a record payload produced by [`encrypt_payload`].
///
/// # Errors
///
/// Returns an error if the payload is truncated or fails authentication.
pub fn decrypt_payload(
    raw_key: &[u8],
    kdf_salt: &[u8; KDF_SALT_SIZE],
    page_size: u32,
    data: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if data.len() < NONCE_SIZE {
        return Err(CipherError::Truncated);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let key = derive_key(raw_key, kdf_salt, page_size);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Authentication)
}
