//! Profile persistence with optimistic envelope versioning.
//!
//! The store never interprets PII. Re-encryption replaces the whole envelope
//! in a single version-guarded update so concurrent recovery attempts cannot
//! observe or produce a half-updated row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{ProfileRecord, ProfileState};
use crate::recovery::crypto::EncryptedPiiEnvelope;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The owner's most recent profile eligible for recovery: pending
    /// activation or active, with an encrypted PII envelope present.
    async fn recoverable_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>>;

    /// Replace the envelope iff the stored version still equals
    /// `expected_version`. Returns `false` when a concurrent writer won.
    async fn replace_envelope(
        &self,
        profile_id: Uuid,
        expected_version: i64,
        envelope: &EncryptedPiiEnvelope,
    ) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn recoverable_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>> {
        let query = r"
            SELECT id, user_id, state::text AS state,
                   pii_key_salt, pii_ciphertext, pii_key_version
            FROM profiles
            WHERE user_id = $1
              AND state IN ('verification_pending', 'active')
              AND pii_ciphertext IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup recoverable profile")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state: String = row.get("state");
        let Some(state) = ProfileState::from_str(&state) else {
            return Ok(None);
        };

        Ok(Some(ProfileRecord {
            profile_id: row.get("id"),
            user_id: row.get("user_id"),
            state,
            envelope: EncryptedPiiEnvelope {
                key_salt: row.get("pii_key_salt"),
                ciphertext: row.get("pii_ciphertext"),
                key_version: row.get("pii_key_version"),
            },
        }))
    }

    async fn replace_envelope(
        &self,
        profile_id: Uuid,
        expected_version: i64,
        envelope: &EncryptedPiiEnvelope,
    ) -> Result<bool> {
        // Single-writer CAS keyed by profile id: the version predicate makes
        // the update a no-op when another recovery attempt committed first.
        let query = r"
            UPDATE profiles
            SET pii_key_salt = $3,
                pii_ciphertext = $4,
                pii_key_version = $5,
                updated_at = NOW()
            WHERE id = $1
              AND pii_key_version = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(profile_id)
            .bind(expected_version)
            .bind(&envelope.key_salt)
            .bind(&envelope.ciphertext)
            .bind(envelope.key_version)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to replace PII envelope")?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing {
    //! In-memory store double for engine and concurrency tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{ProfileRecord, ProfileStore};
    use crate::recovery::crypto::EncryptedPiiEnvelope;

    #[derive(Default)]
    pub(crate) struct InMemoryProfileStore {
        profiles: Mutex<HashMap<Uuid, ProfileRecord>>,
    }

    impl InMemoryProfileStore {
        pub(crate) fn with_profile(record: ProfileRecord) -> Self {
            let store = Self::default();
            store
                .profiles
                .lock()
                .unwrap()
                .insert(record.profile_id, record);
            store
        }

        pub(crate) fn envelope(&self, profile_id: Uuid) -> Option<EncryptedPiiEnvelope> {
            self.profiles
                .lock()
                .unwrap()
                .get(&profile_id)
                .map(|record| record.envelope.clone())
        }
    }

    #[async_trait]
    impl ProfileStore for InMemoryProfileStore {
        async fn recoverable_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>> {
            Ok(self
                .profiles
                .lock()
                .unwrap()
                .values()
                .find(|record| record.user_id == user_id)
                .cloned())
        }

        async fn replace_envelope(
            &self,
            profile_id: Uuid,
            expected_version: i64,
            envelope: &EncryptedPiiEnvelope,
        ) -> Result<bool> {
            let mut profiles = self.profiles.lock().unwrap();
            let Some(record) = profiles.get_mut(&profile_id) else {
                return Ok(false);
            };
            if record.envelope.key_version != expected_version {
                return Ok(false);
            }
            record.envelope = envelope.clone();
            Ok(true)
        }
    }
}
