//! Envelope encryption for profile PII under a personal key.
//!
//! The encryption key is derived from the normalized personal key with
//! Argon2id and a per-envelope random salt. The payload is sealed with
//! ChaCha20-Poly1305 as `nonce (12 bytes) || ciphertext`, with AAD binding
//! the envelope to its owning profile so a ciphertext cannot be replayed
//! against another profile row.

use anyhow::Result;
use argon2::Argon2;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

const KEY_SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A profile's encrypted PII at rest: ciphertext plus key metadata.
///
/// `key_version` increments on every re-encryption and is the token for the
/// store's compare-and-swap update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPiiEnvelope {
    pub key_salt: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub key_version: i64,
}

/// Seal `pii` under `personal_key` (already normalized) for `profile_id`.
///
/// # Errors
/// Returns an error if key derivation or encryption fails.
pub fn encrypt_pii(
    personal_key: &str,
    pii: &[u8],
    profile_id: Uuid,
    key_version: i64,
) -> Result<EncryptedPiiEnvelope> {
    let mut key_salt = vec![0u8; KEY_SALT_LEN];
    OsRng.fill_bytes(&mut key_salt);

    let dek = derive_key(personal_key, &key_salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = construct_aad(profile_id);
    let payload = Payload { msg: pii, aad: &aad };

    let sealed = cipher
        .encrypt(nonce, payload)
        .map_err(|e| anyhow::anyhow!("Encryption failure: {e}"))?;

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
    ciphertext.extend_from_slice(&nonce_bytes);
    ciphertext.extend_from_slice(&sealed);

    Ok(EncryptedPiiEnvelope {
        key_salt,
        ciphertext,
        key_version,
    })
}

/// Open an envelope with `personal_key` (already normalized).
///
/// # Errors
/// Returns an error on any integrity or format failure. Callers must not
/// surface the error text; the recovery engine reclassifies every failure
/// uniformly as an incorrect key.
pub fn decrypt_pii(
    personal_key: &str,
    envelope: &EncryptedPiiEnvelope,
    profile_id: Uuid,
) -> Result<Vec<u8>> {
    if envelope.ciphertext.len() < NONCE_LEN {
        return Err(anyhow::anyhow!("Invalid ciphertext length"));
    }

    let (nonce_bytes, sealed) = envelope.ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let dek = derive_key(personal_key, &envelope.key_salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek));

    let aad = construct_aad(profile_id);
    let payload = Payload {
        msg: sealed,
        aad: &aad,
    };

    let plaintext = cipher
        .decrypt(nonce, payload)
        .map_err(|e| anyhow::anyhow!("Decryption failure: {e}"))?;

    Ok(plaintext)
}

/// Argon2id from the normalized personal key and the envelope salt.
fn derive_key(personal_key: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut dek = [0u8; 32];
    Argon2::default()
        .hash_password_into(personal_key.as_bytes(), salt, &mut dek)
        .map_err(|e| anyhow::anyhow!("Key derivation failure: {e}"))?;
    Ok(dek)
}

fn construct_aad(profile_id: Uuid) -> Vec<u8> {
    // AAD = "pii:v1|profile_id"
    format!("pii:v1|{profile_id}").into_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &str = "ABCDEFGHJKLMNPQR";

    #[test]
    fn encrypt_decrypt_round_trip() {
        let profile_id = Uuid::new_v4();
        let envelope = encrypt_pii(KEY, b"ssn=123-45-6789", profile_id, 1).unwrap();
        assert_ne!(envelope.ciphertext, b"ssn=123-45-6789");

        let plaintext = decrypt_pii(KEY, &envelope, profile_id).unwrap();
        assert_eq!(plaintext, b"ssn=123-45-6789");
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let profile_id = Uuid::new_v4();
        let envelope = encrypt_pii(KEY, b"secret", profile_id, 1).unwrap();
        assert!(decrypt_pii("RQPNMLKJHGFEDCBA", &envelope, profile_id).is_err());
    }

    #[test]
    fn decrypt_fails_for_other_profile() {
        let envelope = encrypt_pii(KEY, b"secret", Uuid::new_v4(), 1).unwrap();
        assert!(decrypt_pii(KEY, &envelope, Uuid::new_v4()).is_err());
    }

    #[test]
    fn decrypt_fails_on_tampered_ciphertext() {
        let profile_id = Uuid::new_v4();
        let mut envelope = encrypt_pii(KEY, b"secret", profile_id, 1).unwrap();
        let len = envelope.ciphertext.len();
        if let Some(byte) = envelope.ciphertext.get_mut(len - 1) {
            *byte ^= 0xFF;
        }
        assert!(decrypt_pii(KEY, &envelope, profile_id).is_err());
    }

    #[test]
    fn decrypt_fails_on_truncated_ciphertext() {
        let envelope = EncryptedPiiEnvelope {
            key_salt: vec![0u8; 16],
            ciphertext: vec![1, 2, 3],
            key_version: 1,
        };
        assert!(decrypt_pii(KEY, &envelope, Uuid::new_v4()).is_err());
    }

    #[test]
    fn fresh_envelopes_use_fresh_salts() {
        let profile_id = Uuid::new_v4();
        let first = encrypt_pii(KEY, b"secret", profile_id, 1).unwrap();
        let second = encrypt_pii(KEY, b"secret", profile_id, 2).unwrap();
        assert_ne!(first.key_salt, second.key_salt);
        assert_ne!(first.ciphertext, second.ciphertext);
    }
}
