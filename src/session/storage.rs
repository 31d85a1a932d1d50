//! Session persistence.
//!
//! Sessions, the SPs they federated with, and in-flight logout requests live
//! in Postgres keyed by the hashed browser token. The disclosure flag is
//! written before the user is redirected to the disclosure screen, never
//! after, so a crash between write and redirect errs on not showing it again.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;

use super::{Principal, VerificationStatus};
use crate::profile::ProfileState;

/// Load the principal for a live session, or `None` when the token is
/// unknown or the session expired.
pub async fn load_principal(pool: &PgPool, session_hash: &str) -> Result<Option<Principal>> {
    let query = r"
        SELECT s.user_id,
               s.fully_authenticated_at IS NOT NULL AS fully_authenticated,
               s.attribute_disclosure_shown,
               s.branded_experience,
               u.verification_status,
               p.state::text AS profile_state
        FROM user_sessions s
        JOIN users u ON u.id = s.user_id
        LEFT JOIN LATERAL (
            SELECT state FROM profiles
            WHERE user_id = s.user_id
            ORDER BY created_at DESC
            LIMIT 1
        ) p ON true
        WHERE s.session_hash = $1
          AND s.expires_at > NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load session principal")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let verification_status: String = row.get("verification_status");
    let verification =
        VerificationStatus::from_str(&verification_status).unwrap_or(VerificationStatus::Unverified);
    let profile = row
        .get::<Option<String>, _>("profile_state")
        .and_then(|state| ProfileState::from_str(&state));

    Ok(Some(Principal {
        user_id: row.get("user_id"),
        fully_authenticated: row.get("fully_authenticated"),
        verification,
        profile,
        attribute_disclosure_shown: row.get("attribute_disclosure_shown"),
        branded_experience: row.get("branded_experience"),
    }))
}

/// Strip pending SP branding. Called when an assertion is issued so stale
/// branding cannot follow the user into the next sign-in.
pub async fn clear_branded_experience(pool: &PgPool, session_hash: &str) -> Result<()> {
    let query = r"
        UPDATE user_sessions
        SET branded_experience = NULL
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to clear branded experience")?;
    Ok(())
}

/// Durably mark the disclosure screen as shown. Called before the redirect
/// that shows it.
pub async fn mark_disclosure_shown(pool: &PgPool, session_hash: &str) -> Result<()> {
    let query = r"
        UPDATE user_sessions
        SET attribute_disclosure_shown = true
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark disclosure shown")?;
    Ok(())
}

/// Remember where to send the user once they finish an interstitial step.
pub async fn store_return_location(
    pool: &PgPool,
    session_hash: &str,
    return_to: &str,
) -> Result<()> {
    let query = r"
        UPDATE user_sessions
        SET return_to = $2
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .bind(return_to)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store return location")?;
    Ok(())
}

/// The NameID asserted during this session, if any assertion went out.
pub async fn session_name_id(pool: &PgPool, session_hash: &str) -> Result<Option<String>> {
    let query = r"
        SELECT name_id FROM user_sessions WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load session name id")?;
    Ok(row.and_then(|row| row.get::<Option<String>, _>("name_id")))
}

/// Record an issued assertion: the asserted NameID and the SP it went to.
/// Federation is what makes an SP eligible for logout fan-out later.
pub async fn link_identity(
    pool: &PgPool,
    session_hash: &str,
    sp_entity_id: &str,
    name_id: &str,
) -> Result<()> {
    let query = r"
        WITH named AS (
            UPDATE user_sessions SET name_id = $3 WHERE session_hash = $1
        )
        INSERT INTO session_identities (session_hash, sp_entity_id)
        VALUES ($1, $2)
        ON CONFLICT (session_hash, sp_entity_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .bind(sp_entity_id)
        .bind(name_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to link session identity")?;
    Ok(())
}

/// SPs this session produced assertions for, in stable order.
pub async fn federated_sps(pool: &PgPool, session_hash: &str) -> Result<Vec<String>> {
    let query = r"
        SELECT sp_entity_id FROM session_identities
        WHERE session_hash = $1
        ORDER BY sp_entity_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(session_hash)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load federated SPs")?;
    Ok(rows.into_iter().map(|row| row.get("sp_entity_id")).collect())
}

/// One fanned-out logout request awaiting its response. The signed message is
/// stored whole because the batch is built once but delivered one at a time.
#[derive(Clone, Debug)]
pub struct PendingLogoutRow {
    pub request_id: String,
    pub sp_entity_id: String,
    pub destination: String,
    pub encoded: String,
}

/// Persist the fan-out batch before the first delivery.
pub async fn insert_pending_logout_requests(
    pool: &PgPool,
    session_hash: &str,
    requests: &[PendingLogoutRow],
) -> Result<()> {
    let query = r"
        INSERT INTO slo_pending_requests
            (request_id, session_hash, sp_entity_id, destination, encoded)
        VALUES ($1, $2, $3, $4, $5)
    ";
    for row in requests {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&row.request_id)
            .bind(session_hash)
            .bind(&row.sp_entity_id)
            .bind(&row.destination)
            .bind(&row.encoded)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to persist pending logout request")?;
    }
    Ok(())
}

/// Fanned-out logout requests not yet answered, in delivery order.
pub async fn pending_logout_requests(
    pool: &PgPool,
    session_hash: &str,
) -> Result<Vec<PendingLogoutRow>> {
    let query = r"
        SELECT request_id, sp_entity_id, destination, encoded
        FROM slo_pending_requests
        WHERE session_hash = $1
        ORDER BY created_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(session_hash)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load pending logout requests")?;
    Ok(rows
        .into_iter()
        .map(|row| PendingLogoutRow {
            request_id: row.get("request_id"),
            sp_entity_id: row.get("sp_entity_id"),
            destination: row.get("destination"),
            encoded: row.get("encoded"),
        })
        .collect())
}

/// Drop one pending logout request once its response arrives.
pub async fn complete_logout_request(
    pool: &PgPool,
    session_hash: &str,
    request_id: &str,
) -> Result<()> {
    let query = r"
        DELETE FROM slo_pending_requests
        WHERE session_hash = $1 AND request_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .bind(request_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to complete pending logout request")?;
    Ok(())
}

/// Remove the session and everything keyed on it.
pub async fn terminate_session(pool: &PgPool, session_hash: &str) -> Result<()> {
    let query = r"
        WITH dropped_identities AS (
            DELETE FROM session_identities WHERE session_hash = $1
        ), dropped_pending AS (
            DELETE FROM slo_pending_requests WHERE session_hash = $1
        )
        DELETE FROM user_sessions WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to terminate session")?;
    Ok(())
}
