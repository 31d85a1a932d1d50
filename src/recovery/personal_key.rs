//! Personal key generation, normalization, and display formatting.
//!
//! A personal key is a user-held recovery secret: 16 characters from a
//! 32-character alphabet (128 bits), shown as `XXXX-XXXX-XXXX-XXXX`.
//! Normalization is deterministic and applied identically when the key is
//! issued and when it is verified, so the same bytes always feed the KDF.

use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};

const PERSONAL_KEY_LEN: usize = 16;
const PERSONAL_KEY_GROUP_SIZE: usize = 4;
const PERSONAL_KEY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a new personal key in grouped display form.
///
/// # Errors
/// Returns an error if the generated key fails formatting (never expected).
pub fn generate() -> Result<String> {
    let mut rng = OsRng;
    generate_with_rng(&mut rng)
}

pub(crate) fn generate_with_rng<R: RngCore + ?Sized>(rng: &mut R) -> Result<String> {
    let mut raw = [0u8; PERSONAL_KEY_LEN];
    rng.fill_bytes(&mut raw);
    let mut normalized = String::with_capacity(PERSONAL_KEY_LEN);
    for byte in raw {
        let idx = usize::from(byte) % PERSONAL_KEY_ALPHABET.len();
        if let Some(&char_byte) = PERSONAL_KEY_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format(&normalized)
}

/// Normalize user input for cryptographic use: drop separators and
/// whitespace, uppercase, and reject anything outside the key alphabet.
///
/// # Errors
/// Returns an error if the input does not normalize to a well-formed key.
pub fn normalize(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != PERSONAL_KEY_LEN {
        return Err(anyhow::anyhow!("invalid personal key length"));
    }

    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| PERSONAL_KEY_ALPHABET.contains(ch))
    {
        return Err(anyhow::anyhow!("invalid personal key characters"));
    }

    Ok(normalized)
}

/// Format a normalized key for one-time display.
///
/// # Errors
/// Returns an error if the input is not a normalized key.
pub fn format(normalized: &str) -> Result<String> {
    if normalized.len() != PERSONAL_KEY_LEN {
        return Err(anyhow::anyhow!("invalid personal key length"));
    }
    let mut out = String::with_capacity(PERSONAL_KEY_LEN + 3);
    for (idx, chunk) in normalized
        .as_bytes()
        .chunks(PERSONAL_KEY_GROUP_SIZE)
        .enumerate()
    {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid personal key chunk")?);
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{format, generate, normalize};

    #[test]
    fn normalize_strips_separators_and_uppercases() {
        let normalized = normalize("abcd-efgh-jklm-npqr").unwrap();
        assert_eq!(normalized, "ABCDEFGHJKLMNPQR");
    }

    #[test]
    fn normalize_tolerates_whitespace() {
        let normalized = normalize(" abcd efgh jklm npqr\n").unwrap();
        assert_eq!(normalized, "ABCDEFGHJKLMNPQR");
    }

    #[test]
    fn normalize_rejects_wrong_length() {
        assert!(normalize("ABCD-EFGH").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn normalize_rejects_out_of_alphabet() {
        // 0, 1, I and O are excluded to avoid transcription mistakes.
        assert!(normalize("ABCD-EFGH-JKLM-NPQ0").is_err());
        assert!(normalize("ABCD-EFGH-JKLM-NPQI").is_err());
    }

    #[test]
    fn format_groups_of_four() {
        assert_eq!(format("ABCDEFGHJKLMNPQR").unwrap(), "ABCD-EFGH-JKLM-NPQR");
    }

    #[test]
    fn generated_keys_round_trip_normalization() {
        let key = generate().unwrap();
        let normalized = normalize(&key).unwrap();
        assert_eq!(format(&normalized).unwrap(), key);
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(generate().unwrap(), generate().unwrap());
    }
}
