//! Personal key submission and PII re-encryption.
//!
//! Flow Overview:
//! 1) Reject absent input, then normalize the submitted key.
//! 2) Find the owner's most recent recoverable profile.
//! 3) Decrypt the profile's PII envelope with the submitted key.
//! 4) Re-encrypt under a freshly generated key and swap the envelope in with
//!    a version-guarded update, retrying the swap exactly once on conflict.
//!
//! Security boundaries:
//! - Every decrypt failure surfaces uniformly as an incorrect key; callers
//!   cannot distinguish a wrong key from a corrupted envelope.
//! - The submitted key is cleared from the form on every failure path and is
//!   never logged; the new key exists in plaintext only in the returned
//!   one-time disclosure.

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::{crypto, personal_key};
use crate::analytics::{self, Analytics};
use crate::profile::{ProfileRecord, ProfileStore};

/// Terminal outcome of one submission; none of these is retried
/// automatically, the caller re-prompts the user.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("personal key is required")]
    MissingKey,
    #[error("no profile is eligible for recovery")]
    NoRecoverableProfile,
    #[error("personal key is incorrect")]
    PersonalKeyIncorrect,
    #[error("profile was updated concurrently, try again")]
    Conflict,
    #[error("recovery unavailable")]
    Internal(#[source] anyhow::Error),
}

impl RecoveryError {
    /// Stable machine-readable code for API responses and analytics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingKey => "missing_key",
            Self::NoRecoverableProfile => "no_recoverable_profile",
            Self::PersonalKeyIncorrect => "personal_key_incorrect",
            Self::Conflict => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

/// The replacement personal key, shown to the user exactly once.
#[derive(Debug)]
pub struct NewSecretDisclosure {
    pub personal_key: String,
}

/// One recovery attempt for one user. The submitted key lives behind
/// `SecretString` so it never appears in debug output.
pub struct PersonalKeyForm {
    user_id: Uuid,
    personal_key: Option<SecretString>,
}

impl PersonalKeyForm {
    #[must_use]
    pub fn new(user_id: Uuid, personal_key: Option<String>) -> Self {
        let personal_key = personal_key
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);
        Self {
            user_id,
            personal_key,
        }
    }

    /// Validate the submitted key and re-encrypt the profile PII on success.
    ///
    /// Records one analytics event per submission with the outcome class,
    /// never the key itself.
    ///
    /// # Errors
    /// See [`RecoveryError`]; all variants are terminal for this attempt.
    pub async fn submit(
        &mut self,
        store: &dyn ProfileStore,
        analytics: &dyn Analytics,
    ) -> Result<NewSecretDisclosure, RecoveryError> {
        let result = self.validate_and_reencrypt(store).await;

        analytics.record(
            analytics::PERSONAL_KEY_REACTIVATION,
            json!({
                "success": result.is_ok(),
                "error": result.as_ref().err().map(RecoveryError::code),
            }),
        );

        match result {
            Ok(disclosure) => {
                info!(user_id = %self.user_id, "personal key accepted, PII re-encrypted");
                Ok(disclosure)
            }
            Err(err) => {
                // A failed attempt's input must never be retained or echoed.
                self.reset_sensitive_fields();
                warn!(user_id = %self.user_id, error = err.code(), "personal key submission rejected");
                Err(err)
            }
        }
    }

    async fn validate_and_reencrypt(
        &self,
        store: &dyn ProfileStore,
    ) -> Result<NewSecretDisclosure, RecoveryError> {
        let Some(submitted) = self.personal_key.as_ref() else {
            return Err(RecoveryError::MissingKey);
        };

        // Normalization happens before any cryptographic use; a key that does
        // not normalize can never decrypt, but an absent profile still takes
        // precedence so we never touch the envelope in that case.
        let normalized = personal_key::normalize(submitted.expose_secret());

        let profile = store
            .recoverable_profile(self.user_id)
            .await
            .map_err(RecoveryError::Internal)?
            .ok_or(RecoveryError::NoRecoverableProfile)?;

        let normalized = normalized.map_err(|_| RecoveryError::PersonalKeyIncorrect)?;

        let pii = decrypt_or_incorrect(&normalized, &profile)?;

        match self.reencrypt(store, &profile, &pii).await? {
            Some(disclosure) => Ok(disclosure),
            // Concurrent writer won the swap: re-read and retry exactly once.
            // The submitted key must still open the fresh envelope; if the
            // other writer already rotated it, the key is simply spent.
            None => {
                let profile = store
                    .recoverable_profile(self.user_id)
                    .await
                    .map_err(RecoveryError::Internal)?
                    .ok_or(RecoveryError::NoRecoverableProfile)?;
                let pii = decrypt_or_incorrect(&normalized, &profile)?;
                self.reencrypt(store, &profile, &pii)
                    .await?
                    .ok_or(RecoveryError::Conflict)
            }
        }
    }

    /// Seal `pii` under a new personal key and attempt the version-guarded
    /// swap. `Ok(None)` means a concurrent writer updated the envelope first.
    async fn reencrypt(
        &self,
        store: &dyn ProfileStore,
        profile: &ProfileRecord,
        pii: &[u8],
    ) -> Result<Option<NewSecretDisclosure>, RecoveryError> {
        let display_key = personal_key::generate().map_err(RecoveryError::Internal)?;
        let new_key = personal_key::normalize(&display_key).map_err(RecoveryError::Internal)?;

        let envelope = crypto::encrypt_pii(
            &new_key,
            pii,
            profile.profile_id,
            profile.envelope.key_version + 1,
        )
        .map_err(RecoveryError::Internal)?;

        let swapped = store
            .replace_envelope(profile.profile_id, profile.envelope.key_version, &envelope)
            .await
            .map_err(RecoveryError::Internal)?;

        if swapped {
            Ok(Some(NewSecretDisclosure {
                personal_key: display_key,
            }))
        } else {
            Ok(None)
        }
    }

    fn reset_sensitive_fields(&mut self) {
        self.personal_key = None;
    }
}

fn decrypt_or_incorrect(
    normalized: &str,
    profile: &ProfileRecord,
) -> Result<Vec<u8>, RecoveryError> {
    // Wrong key, corrupted payload, and empty plaintext all collapse into one
    // error so the endpoint is not a decryption oracle.
    match crypto::decrypt_pii(normalized, &profile.envelope, profile.profile_id) {
        Ok(pii) if !pii.is_empty() => Ok(pii),
        Ok(_) | Err(_) => Err(RecoveryError::PersonalKeyIncorrect),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{PersonalKeyForm, RecoveryError};
    use crate::analytics::testing::CapturingAnalytics;
    use crate::profile::store::testing::InMemoryProfileStore;
    use crate::profile::{ProfileRecord, ProfileState, ProfileStore};
    use crate::recovery::{crypto, personal_key};

    const PII: &[u8] = br#"{"first_name":"Ada","ssn":"900-12-3456"}"#;

    fn seeded_store(user_id: Uuid) -> (InMemoryProfileStore, Uuid, String) {
        let profile_id = Uuid::new_v4();
        let display_key = personal_key::generate().unwrap();
        let normalized = personal_key::normalize(&display_key).unwrap();
        let envelope = crypto::encrypt_pii(&normalized, PII, profile_id, 1).unwrap();
        let store = InMemoryProfileStore::with_profile(ProfileRecord {
            profile_id,
            user_id,
            state: ProfileState::VerificationPending,
            envelope,
        });
        (store, profile_id, display_key)
    }

    #[tokio::test]
    async fn missing_key_rejected_without_touching_storage() {
        let analytics = CapturingAnalytics::default();
        let store = InMemoryProfileStore::default();
        let mut form = PersonalKeyForm::new(Uuid::new_v4(), None);
        let err = form.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::MissingKey));

        let mut form = PersonalKeyForm::new(Uuid::new_v4(), Some("   ".to_string()));
        let err = form.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::MissingKey));
    }

    #[tokio::test]
    async fn no_recoverable_profile_takes_precedence_over_bad_key() {
        let analytics = CapturingAnalytics::default();
        let store = InMemoryProfileStore::default();
        let mut form = PersonalKeyForm::new(Uuid::new_v4(), Some("not-a-key".to_string()));
        let err = form.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NoRecoverableProfile));
    }

    #[tokio::test]
    async fn wrong_key_leaves_envelope_unchanged() {
        let user_id = Uuid::new_v4();
        let (store, profile_id, _key) = seeded_store(user_id);
        let analytics = CapturingAnalytics::default();
        let before = store.envelope(profile_id).unwrap();

        let mut form =
            PersonalKeyForm::new(user_id, Some("AAAA-BBBB-CCCC-DDDD".to_string()));
        let err = form.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::PersonalKeyIncorrect));
        assert_eq!(store.envelope(profile_id).unwrap(), before);
    }

    #[tokio::test]
    async fn malformed_key_reported_as_incorrect() {
        let user_id = Uuid::new_v4();
        let (store, _profile_id, _key) = seeded_store(user_id);
        let analytics = CapturingAnalytics::default();
        let mut form = PersonalKeyForm::new(user_id, Some("too-short".to_string()));
        let err = form.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::PersonalKeyIncorrect));
    }

    #[tokio::test]
    async fn correct_key_rotates_and_invalidates_old_key() {
        let user_id = Uuid::new_v4();
        let (store, profile_id, old_key) = seeded_store(user_id);
        let analytics = CapturingAnalytics::default();

        let mut form = PersonalKeyForm::new(user_id, Some(old_key.clone()));
        let disclosure = form.submit(&store, &analytics).await.unwrap();
        assert_ne!(disclosure.personal_key, old_key);
        assert_eq!(store.envelope(profile_id).unwrap().key_version, 2);

        // Old key must fail against the rotated envelope (single use).
        let mut replay = PersonalKeyForm::new(user_id, Some(old_key));
        let err = replay.submit(&store, &analytics).await.unwrap_err();
        assert!(matches!(err, RecoveryError::PersonalKeyIncorrect));

        // The disclosed key opens the new envelope.
        let mut fresh = PersonalKeyForm::new(user_id, Some(disclosure.personal_key));
        fresh.submit(&store, &analytics).await.unwrap();
    }

    #[tokio::test]
    async fn records_one_event_per_submission() {
        let user_id = Uuid::new_v4();
        let (store, _profile_id, key) = seeded_store(user_id);
        let analytics = CapturingAnalytics::default();

        let mut form = PersonalKeyForm::new(user_id, Some(key));
        form.submit(&store, &analytics).await.unwrap();

        let events = analytics.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, crate::analytics::PERSONAL_KEY_REACTIVATION);
        assert_eq!(events[0].1["success"], true);
    }

    #[tokio::test]
    async fn concurrent_submissions_yield_exactly_one_success() {
        let user_id = Uuid::new_v4();
        let (store, profile_id, key) = seeded_store(user_id);
        let store = Arc::new(store);
        let analytics = Arc::new(CapturingAnalytics::default());

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            let analytics = Arc::clone(&analytics);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let mut form = PersonalKeyForm::new(user_id, Some(key));
                form.submit(store.as_ref(), analytics.as_ref()).await
            }));
        }

        let mut successes = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => successes += 1,
                // The loser sees either a spent key (after the winner's
                // rotation) or a persistent conflict; both are deterministic,
                // well-defined outcomes.
                Err(RecoveryError::PersonalKeyIncorrect | RecoveryError::Conflict) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.envelope(profile_id).unwrap().key_version, 2);
    }
}
