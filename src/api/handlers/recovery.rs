//! Personal-key recovery endpoint.

use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::error;
use utoipa::ToSchema;

use super::session_hash;
use crate::analytics::Analytics;
use crate::profile::PgProfileStore;
use crate::recovery::{PersonalKeyForm, RecoveryError};
use crate::session::storage;

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyPersonalKeyRequest {
    personal_key: Option<String>,
}

/// The replacement key. Returned once; it is never persisted in plaintext.
#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyPersonalKeyResponse {
    personal_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecoveryErrorResponse {
    error: &'static str,
}

/// Verify the submitted personal key and rotate it on success.
#[utoipa::path(
    post,
    path = "/v1/account/personal-key/verify",
    request_body = VerifyPersonalKeyRequest,
    responses(
        (status = 200, description = "Key accepted; the replacement key is disclosed once", body = VerifyPersonalKeyResponse),
        (status = 401, description = "No authenticated session"),
        (status = 409, description = "Concurrent update, retry", body = RecoveryErrorResponse),
        (status = 422, description = "Key rejected", body = RecoveryErrorResponse)
    ),
    tag = "account"
)]
pub async fn verify_personal_key(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    analytics: Extension<Arc<dyn Analytics>>,
    payload: Option<Json<VerifyPersonalKeyRequest>>,
) -> impl IntoResponse {
    let principal = match session_hash(&headers) {
        Some(hash) => match storage::load_principal(&pool, &hash).await {
            Ok(principal) => principal,
            Err(err) => {
                error!("Failed to load session: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RecoveryErrorResponse { error: "internal" }),
                )
                    .into_response();
            }
        },
        None => None,
    };
    let Some(principal) = principal else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !principal.fully_authenticated {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let submitted = payload.and_then(|Json(request)| request.personal_key);
    let store = PgProfileStore::new(pool.0.clone());
    let mut form = PersonalKeyForm::new(principal.user_id, submitted);

    match form.submit(&store, analytics.0.as_ref()).await {
        Ok(disclosure) => (
            StatusCode::OK,
            Json(VerifyPersonalKeyResponse {
                personal_key: disclosure.personal_key,
            }),
        )
            .into_response(),
        Err(err) => {
            let status = match &err {
                RecoveryError::Conflict => StatusCode::CONFLICT,
                RecoveryError::Internal(source) => {
                    error!("Personal key recovery failed: {source}");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                RecoveryError::MissingKey
                | RecoveryError::NoRecoverableProfile
                | RecoveryError::PersonalKeyIncorrect => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (status, Json(RecoveryErrorResponse { error: err.code() })).into_response()
        }
    }
}
