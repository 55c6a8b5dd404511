//! Decryption of the InteMedic container metadata entry.
//!
//! The `.tron` metadata entry is laid out as:
//!
//! ```text
//! [32-byte SHA-256 digest of the plaintext]
//! [16-byte PBKDF2 salt]
//! [16-byte AES IV]
//! [ciphertext, AES-256-CBC, PKCS#7 padding]
//! ```
//!
//! The key is derived from a fixed vendor secret via PBKDF2-HMAC-SHA1 over
//! the per-file salt. After decrypt and unpad, the plaintext digest must
//! match the stored one; any mismatch is treated as a malformed file.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::SlideError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Fixed vendor secret the scanner software derives the metadata key from.
pub(crate) const METADATA_SECRET: &[u8] = b"iNteMedIc@TrOnSlide#2016";

/// PBKDF2 iteration count used by the scanner software.
pub(crate) const PBKDF2_ROUNDS: u32 = 2000;

/// Derived AES key length in bytes (AES-256).
const KEY_LEN: usize = 32;

/// Byte length of the digest + salt + IV prefix.
const PREFIX_LEN: usize = 32 + 16 + 16;

/// Decrypt and verify a metadata blob, returning the plaintext.
///
/// Fails with `BadData` when the blob is too short, the padding is
/// invalid, or the plaintext digest does not match the stored one.
pub fn decrypt_metadata(blob: &[u8]) -> Result<Vec<u8>, SlideError> {
    if blob.len() < PREFIX_LEN {
        return Err(SlideError::bad_data(format!(
            "metadata blob too short: {} bytes",
            blob.len()
        )));
    }

    let (digest, rest) = blob.split_at(32);
    let (salt, rest) = rest.split_at(16);
    let (iv, ciphertext) = rest.split_at(16);

    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(SlideError::bad_data(format!(
            "metadata ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }

    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(METADATA_SECRET, salt, PBKDF2_ROUNDS, &mut key);

    let decryptor = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|e| SlideError::bad_data(format!("bad key or IV length: {e}")))?;

    let plaintext = decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SlideError::bad_data("metadata padding invalid"))?;

    let actual = Sha256::digest(&plaintext);
    if actual.as_slice() != digest {
        return Err(SlideError::bad_data(format!(
            "metadata checksum mismatch: stored {}, computed {}",
            hex::encode(digest),
            hex::encode(actual)
        )));
    }

    Ok(plaintext)
}

// =============================================================================
// Tests
// =============================================================================
