//! Profile records and their encrypted PII envelopes.

pub mod store;

pub use store::{PgProfileStore, ProfileStore};

use uuid::Uuid;

use crate::recovery::crypto::EncryptedPiiEnvelope;

/// Lifecycle state of a profile row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProfileState {
    VerificationPending,
    Active,
}

impl ProfileState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationPending => "verification_pending",
            Self::Active => "active",
        }
    }

    pub(crate) fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "verification_pending" => Some(Self::VerificationPending),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

/// A profile eligible for personal-key recovery.
#[derive(Clone, Debug)]
pub struct ProfileRecord {
    pub profile_id: Uuid,
    pub user_id: Uuid,
    pub state: ProfileState,
    pub envelope: EncryptedPiiEnvelope,
}
