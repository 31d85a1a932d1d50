//! Session principals.
//!
//! The browser holds an opaque session token; the server stores sessions
//! keyed by the token's SHA-256 hash so a database leak does not leak usable
//! tokens. A [`Principal`] is the flattened view of one session joined with
//! its user's verification status and newest profile, which is all the
//! bridge needs to decide.

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::profile::ProfileState;

pub mod storage;

/// Where the user stands in identity verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerificationStatus {
    Unverified,
    Pending,
    Verified,
}

impl VerificationStatus {
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "unverified" => Some(Self::Unverified),
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

/// Flattened session facts the bridge decides on.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    /// All required credential factors have been presented this session.
    pub fully_authenticated: bool,
    pub verification: VerificationStatus,
    /// Newest profile state, if the user has any profile.
    pub profile: Option<ProfileState>,
    /// The disclosure screen has been shown during this session.
    pub attribute_disclosure_shown: bool,
    /// SP branding applied while signing in, pending until an assertion is
    /// issued. Stripped at issuance so it cannot leak into later sign-ins.
    pub branded_experience: Option<String>,
}

/// Hash a browser session token into the storage key.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}

#[cfg(test)]
mod tests {
    use super::{VerificationStatus, hash_token};

    #[test]
    fn token_hash_is_stable_and_url_safe() {
        let hash = hash_token("session-token");
        assert_eq!(hash, hash_token("session-token"));
        assert_ne!(hash, hash_token("other-token"));
        assert!(!hash.contains('='));
        assert!(!hash.contains('+'));
        assert!(!hash.contains('/'));
    }

    #[test]
    fn verification_status_parses_known_values() {
        assert_eq!(
            VerificationStatus::from_str("verified"),
            Some(VerificationStatus::Verified)
        );
        assert_eq!(VerificationStatus::from_str("bogus"), None);
    }
}
