use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};
use crate::settings::PasswordHashSettings;

pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// PBKDF2-HMAC-SHA256 over `passphrase` and `salt`.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    if iterations == 0 {
        return Err(CoreError::Crypto("kdf iterations must be > 0".into()));
    }
    if salt.len() < SALT_LEN {
        return Err(CoreError::Crypto(format!(
            "kdf salt must be at least {SALT_LEN} bytes"
        )));
    }
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    Ok(key)
}

/// Argon2id PHC string for the master credential.
pub fn hash_password(passphrase: &str, cost: &PasswordHashSettings) -> Result<String> {
    let params = Params::new(cost.memory_kib, cost.time_cost, cost.parallelism, None)
        .map_err(|e| CoreError::Crypto(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::encode_b64(&generate_salt())
        .map_err(|e| CoreError::Crypto(format!("argon2 salt: {e}")))?;
    let hash = argon
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| CoreError::Crypto(format!("argon2 hash: {e}")))?;
    Ok(hash.to_string())
}

/// Constant-time check of `passphrase` against a stored PHC string.
///
/// A corrupt hash or any library failure counts as a mismatch.
pub fn verify_password(passphrase: &str, phc: &str) -> bool {
    let parsed = match PasswordHash::new(phc) {
        Ok(p) => p,
        Err(e) => {
            warn!("stored credential hash is unreadable: {e}");
            return false;
        }
    };
    Argon2::default()
        .verify_password(passphrase.as_bytes(), &parsed)
        .is_ok()
}

pub fn seal(
    key: &[u8; DERIVED_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CoreError::Crypto(format!("encrypt: {e}")))
}

pub fn open(
    key: &[u8; DERIVED_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CoreError::Decryption("authentication failed".into()))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_key() -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}
