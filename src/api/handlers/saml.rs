//! SAML endpoints: single sign-on, metadata, single logout.
//!
//! Flow Overview:
//! The SSO endpoint decodes the AuthnRequest, loads the session principal,
//! and either redirects the user into the account UI to finish a required
//! step or returns the signed assertion on an auto-submitting POST form. The
//! logout endpoint classifies what arrived (an SP's request, a response to
//! our fan-out, or nothing) and advances single logout one step per hit.
//!
//! Security boundaries: POST-binding pages carry a Content-Security-Policy
//! whose form-action is pinned to the one destination origin. The disclosure
//! flag is written before the disclosure redirect. Each evaluation records
//! exactly one analytics event.

use std::sync::Arc;

use axum::{
    Form,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, warn};
use utoipa::ToSchema;

use super::{BridgeState, SESSION_COOKIE, post_binding_csp, session_hash};
use crate::analytics::{self, Analytics};
use crate::saml::{
    BridgeDecision, LogoutMessage, RedirectParams, RedirectTarget, RequestDemands, SamlBinding,
    SamlRequest, SignedMessage, SloContext, bridge, evaluate_authentication, metadata, request,
    response,
    slo::{self, LogoutOutcome},
};
use crate::session::storage;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SsoParams {
    #[serde(rename = "SAMLRequest")]
    saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
    #[serde(rename = "SigAlg")]
    sig_alg: Option<String>,
    #[serde(rename = "Signature")]
    signature: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SloParams {
    #[serde(rename = "SAMLRequest")]
    saml_request: Option<String>,
    #[serde(rename = "SAMLResponse")]
    saml_response: Option<String>,
    #[serde(rename = "SigAlg")]
    sig_alg: Option<String>,
    #[serde(rename = "Signature")]
    signature: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/saml/auth",
    responses(
        (status = 200, description = "Signed assertion on an auto-submitting form", body = String),
        (status = 302, description = "User must finish a step in the account UI"),
        (status = 400, description = "Malformed or unregistered request", body = String)
    ),
    tag = "saml"
)]
pub async fn sso_redirect(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<BridgeState>>,
    analytics: Extension<Arc<dyn Analytics>>,
    Query(params): Query<SsoParams>,
) -> Response {
    handle_sso(
        SamlBinding::HttpRedirect,
        params,
        &headers,
        &pool,
        &state,
        analytics.0.as_ref(),
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/saml/auth",
    request_body(content = SsoParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Signed assertion on an auto-submitting form", body = String),
        (status = 302, description = "User must finish a step in the account UI"),
        (status = 400, description = "Malformed or unregistered request", body = String)
    ),
    tag = "saml"
)]
pub async fn sso_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<BridgeState>>,
    analytics: Extension<Arc<dyn Analytics>>,
    Form(params): Form<SsoParams>,
) -> Response {
    handle_sso(
        SamlBinding::HttpPost,
        params,
        &headers,
        &pool,
        &state,
        analytics.0.as_ref(),
    )
    .await
}

async fn handle_sso(
    binding: SamlBinding,
    params: SsoParams,
    headers: &HeaderMap,
    pool: &PgPool,
    state: &BridgeState,
    analytics: &dyn Analytics,
) -> Response {
    let Some(encoded) = params.saml_request.as_deref() else {
        return (StatusCode::BAD_REQUEST, "Missing SAMLRequest".to_string()).into_response();
    };

    let (saml_request, sp) = match request::parse_authn_request(
        encoded,
        binding,
        params.relay_state.clone(),
        &state.registry,
    ) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("Rejected AuthnRequest: {err}");
            return (StatusCode::BAD_REQUEST, "Invalid SAMLRequest".to_string()).into_response();
        }
    };

    // A registered key makes signatures mandatory on the redirect binding.
    if binding == SamlBinding::HttpRedirect && sp.certificate_pem.is_some() {
        let redirect_params = RedirectParams {
            relay_state: params.relay_state.clone(),
            sig_alg: params.sig_alg.clone(),
            signature: params.signature.clone(),
        };
        if let Err(err) =
            request::verify_redirect_signature(sp, "SAMLRequest", encoded, &redirect_params)
        {
            warn!(issuer = %saml_request.issuer, "Rejected AuthnRequest signature: {err}");
            return (StatusCode::BAD_REQUEST, "Invalid signature".to_string()).into_response();
        }
    }

    let session = match session_hash(headers) {
        Some(hash) => match storage::load_principal(pool, &hash).await {
            Ok(principal) => principal.map(|principal| (hash, principal)),
            Err(err) => {
                error!("Failed to load session: {err}");
                return internal_error();
            }
        },
        None => None,
    };

    let Some((hash, principal)) = session else {
        record_sso_event(
            analytics,
            &saml_request,
            saml_request.requests_verified_identity(),
            false,
            None,
        );
        return Redirect::to(&state.frontend_url(RedirectTarget::CompleteCredentials.path()))
            .into_response();
    };

    let demands = RequestDemands {
        identity_verification: saml_request.requests_verified_identity(),
    };
    let decision = evaluate_authentication(&principal, &demands);
    record_sso_event(
        analytics,
        &saml_request,
        demands.identity_verification && bridge::needs_identity_verification(&principal),
        bridge::needs_profile_finish(&principal),
        Some(decision),
    );

    match decision {
        BridgeDecision::Redirect(target) => {
            let resume = resume_url(&params);
            if let Err(err) = storage::store_return_location(pool, &hash, &resume).await {
                error!("Failed to store return location: {err}");
                return internal_error();
            }
            if target == RedirectTarget::AttributeDisclosure {
                // Durable before the redirect: a crash after this point skips
                // the screen rather than showing it twice.
                if let Err(err) = storage::mark_disclosure_shown(pool, &hash).await {
                    error!("Failed to record disclosure: {err}");
                    return internal_error();
                }
            }
            Redirect::to(&state.frontend_url(target.path())).into_response()
        }
        BridgeDecision::Assertion => {
            // Pending SP branding must not outlive issuance.
            if let Err(err) = storage::clear_branded_experience(pool, &hash).await {
                error!("Failed to clear branded experience: {err}");
                return internal_error();
            }
            let name_id = principal.user_id.to_string();
            let message = match response::build_signed_response(
                &state.signer,
                &state.idp,
                &saml_request,
                &name_id,
                Utc::now(),
            ) {
                Ok(message) => message,
                Err(err) => {
                    error!(issuer = %saml_request.issuer, "Failed to build assertion: {err}");
                    return internal_error();
                }
            };
            if let Err(err) =
                storage::link_identity(pool, &hash, &saml_request.issuer, &name_id).await
            {
                error!("Failed to link session identity: {err}");
                return internal_error();
            }
            post_binding_response(&message)
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/saml/metadata",
    responses(
        (status = 200, description = "Signed IdP metadata", body = String)
    ),
    tag = "saml"
)]
pub async fn idp_metadata(state: Extension<Arc<BridgeState>>) -> Response {
    match metadata::signed_metadata(&state.signer, &state.idp) {
        Ok(xml) => (
            [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
            xml,
        )
            .into_response(),
        Err(err) => {
            error!("Failed to render metadata: {err}");
            internal_error()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/saml/logout",
    responses(
        (status = 200, description = "Logout message on an auto-submitting form", body = String),
        (status = 302, description = "Logout finished, user sent to the signed-out page")
    ),
    tag = "saml"
)]
pub async fn slo_redirect(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<BridgeState>>,
    analytics: Extension<Arc<dyn Analytics>>,
    Query(params): Query<SloParams>,
) -> Response {
    handle_slo(
        SamlBinding::HttpRedirect,
        params,
        &headers,
        &pool,
        &state,
        analytics.0.as_ref(),
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/saml/logout",
    request_body(content = SloParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Logout message on an auto-submitting form", body = String),
        (status = 302, description = "Logout finished, user sent to the signed-out page")
    ),
    tag = "saml"
)]
pub async fn slo_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<BridgeState>>,
    analytics: Extension<Arc<dyn Analytics>>,
    Form(params): Form<SloParams>,
) -> Response {
    handle_slo(
        SamlBinding::HttpPost,
        params,
        &headers,
        &pool,
        &state,
        analytics.0.as_ref(),
    )
    .await
}

async fn handle_slo(
    binding: SamlBinding,
    params: SloParams,
    headers: &HeaderMap,
    pool: &PgPool,
    state: &BridgeState,
    analytics: &dyn Analytics,
) -> Response {
    let inbound = decode_inbound_logout(binding, &params, state);

    let hash = session_hash(headers);
    let (context, pending_rows) = match &hash {
        Some(hash) => match load_slo_context(pool, hash).await {
            Ok(loaded) => loaded,
            Err(err) => {
                error!("Failed to load logout state: {err}");
                return internal_error();
            }
        },
        None => (SloContext::default(), Vec::new()),
    };

    let outcome = match slo::evaluate_logout(
        &context,
        inbound.as_ref(),
        &state.signer,
        &state.idp,
        &state.registry,
        analytics,
        Utc::now(),
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Logout evaluation failed: {err}");
            return internal_error();
        }
    };

    match outcome {
        LogoutOutcome::Finished => {
            if let Some(hash) = &hash {
                if let Err(err) = storage::terminate_session(pool, hash).await {
                    error!("Failed to terminate session: {err}");
                    return internal_error();
                }
            }
            signed_out_redirect(state)
        }
        LogoutOutcome::RespondToSp(message) => {
            if let Some(hash) = &hash {
                if let Err(err) = storage::terminate_session(pool, hash).await {
                    error!("Failed to terminate session: {err}");
                    return internal_error();
                }
            }
            with_cleared_session(post_binding_response(&message))
        }
        LogoutOutcome::FanOut(requests) => {
            let Some(hash) = &hash else {
                // No session to fan out from.
                return signed_out_redirect(state);
            };
            let rows: Vec<storage::PendingLogoutRow> = requests
                .iter()
                .map(|pending| storage::PendingLogoutRow {
                    request_id: pending.request_id.clone(),
                    sp_entity_id: pending.sp_entity_id.clone(),
                    destination: pending.message.destination.clone(),
                    encoded: pending.message.encoded.clone(),
                })
                .collect();
            if let Err(err) = storage::insert_pending_logout_requests(pool, hash, &rows).await {
                error!("Failed to persist logout fan-out: {err}");
                return internal_error();
            }
            // The batch is delivered one request per browser round trip.
            post_binding_response(&requests[0].message)
        }
        LogoutOutcome::AwaitResponses { remaining } => {
            let Some(hash) = &hash else {
                return signed_out_redirect(state);
            };
            for id in context
                .pending_request_ids
                .iter()
                .filter(|id| !remaining.contains(*id))
            {
                if let Err(err) = storage::complete_logout_request(pool, hash, id).await {
                    error!("Failed to settle logout request: {err}");
                    return internal_error();
                }
            }
            match pending_rows
                .iter()
                .find(|row| remaining.contains(&row.request_id))
            {
                Some(row) => post_binding_response(&SignedMessage {
                    destination: row.destination.clone(),
                    field_name: "SAMLRequest",
                    encoded: row.encoded.clone(),
                    relay_state: None,
                    id: row.request_id.clone(),
                }),
                None => {
                    if let Err(err) = storage::terminate_session(pool, hash).await {
                        error!("Failed to terminate session: {err}");
                        return internal_error();
                    }
                    signed_out_redirect(state)
                }
            }
        }
    }
}

/// Decode whichever logout message arrived; anything invalid degrades to
/// "no message" and the evaluation proceeds IdP-initiated.
fn decode_inbound_logout(
    binding: SamlBinding,
    params: &SloParams,
    state: &BridgeState,
) -> Option<LogoutMessage> {
    let (encoded, param_name) = match (&params.saml_request, &params.saml_response) {
        (Some(encoded), _) => (encoded.as_str(), "SAMLRequest"),
        (None, Some(encoded)) => (encoded.as_str(), "SAMLResponse"),
        (None, None) => return None,
    };

    let message = match request::parse_logout_message(encoded, binding) {
        Ok(message) => message,
        Err(err) => {
            warn!("Ignoring undecodable logout message: {err}");
            return None;
        }
    };

    if binding == SamlBinding::HttpRedirect {
        if let Some(sp) = state.registry.lookup(message.issuer()) {
            if sp.certificate_pem.is_some() {
                let redirect_params = RedirectParams {
                    relay_state: None,
                    sig_alg: params.sig_alg.clone(),
                    signature: params.signature.clone(),
                };
                if let Err(err) =
                    request::verify_redirect_signature(sp, param_name, encoded, &redirect_params)
                {
                    warn!(issuer = %message.issuer(), "Ignoring logout message with bad signature: {err}");
                    return None;
                }
            }
        }
    }

    Some(message)
}

async fn load_slo_context(
    pool: &PgPool,
    hash: &str,
) -> anyhow::Result<(SloContext, Vec<storage::PendingLogoutRow>)> {
    let pending_rows = storage::pending_logout_requests(pool, hash).await?;
    let context = SloContext {
        name_id: storage::session_name_id(pool, hash).await?,
        pending_request_ids: pending_rows
            .iter()
            .map(|row| row.request_id.clone())
            .collect(),
        federated_sps: storage::federated_sps(pool, hash).await?,
    };
    Ok((context, pending_rows))
}

/// One event per evaluation: the outcome plus the request metadata and the
/// step flags that drove the decision.
fn record_sso_event(
    analytics: &dyn Analytics,
    request: &SamlRequest,
    idv: bool,
    finish_profile: bool,
    decision: Option<BridgeDecision>,
) {
    let next_step = match decision {
        Some(BridgeDecision::Assertion) => None,
        Some(BridgeDecision::Redirect(target)) => Some(target.path()),
        None => Some(RedirectTarget::CompleteCredentials.path()),
    };
    analytics.record(
        analytics::SAML_AUTH,
        json!({
            "issuer": request.issuer,
            "request_id": request.id,
            "idv": idv,
            "finish_profile": finish_profile,
            "success": next_step.is_none(),
            "next_step": next_step,
        }),
    );
}

/// Query string that replays this request once the user returns from an
/// interstitial step.
fn resume_url(params: &SsoParams) -> String {
    let mut url = String::from("/api/saml/auth");
    let mut separator = '?';
    for (name, value) in [
        ("SAMLRequest", params.saml_request.as_deref()),
        ("RelayState", params.relay_state.as_deref()),
        ("SigAlg", params.sig_alg.as_deref()),
        ("Signature", params.signature.as_deref()),
    ] {
        if let Some(value) = value {
            url.push(separator);
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
            separator = '&';
        }
    }
    url
}

fn post_binding_response(message: &SignedMessage) -> Response {
    let origin = match response::form_action_origin(&message.destination) {
        Ok(origin) => origin,
        Err(err) => {
            error!("Refusing POST binding to invalid destination: {err}");
            return internal_error();
        }
    };
    let mut http_response = Html(response::post_binding_form(message)).into_response();
    if let Some(csp) = post_binding_csp(&origin) {
        http_response
            .headers_mut()
            .insert(header::CONTENT_SECURITY_POLICY, csp);
    }
    http_response
}

fn signed_out_redirect(state: &BridgeState) -> Response {
    with_cleared_session(Redirect::to(&state.frontend_url("/account/logged_out")).into_response())
}

fn with_cleared_session(mut http_response: Response) -> Response {
    if let Ok(cookie) = HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}=; Max-Age=0; Path=/; HttpOnly; Secure; SameSite=Lax"
    )) {
        http_response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    http_response
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Service unavailable".to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{SsoParams, record_sso_event, resume_url};
    use crate::analytics::{self, testing::CapturingAnalytics};
    use crate::saml::{BridgeDecision, RedirectTarget, SamlRequest};

    #[test]
    fn resume_url_preserves_present_params_only() {
        let params = SsoParams {
            saml_request: Some("abc+/=".to_string()),
            relay_state: Some("state".to_string()),
            sig_alg: None,
            signature: None,
        };
        assert_eq!(
            resume_url(&params),
            "/api/saml/auth?SAMLRequest=abc%2B%2F%3D&RelayState=state"
        );
    }

    #[test]
    fn sso_event_carries_request_metadata_and_flags() {
        let sink = CapturingAnalytics::default();
        let request = SamlRequest {
            id: "_req-1".to_string(),
            issuer: "https://sp.example.com".to_string(),
            acs_url: "https://sp.example.com/acs".to_string(),
            name_id_format: None,
            authn_context: None,
            relay_state: None,
        };

        record_sso_event(
            &sink,
            &request,
            true,
            false,
            Some(BridgeDecision::Redirect(
                RedirectTarget::IdentityVerification,
            )),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, analytics::SAML_AUTH);
        assert_eq!(events[0].1["issuer"], json!("https://sp.example.com"));
        assert_eq!(events[0].1["request_id"], json!("_req-1"));
        assert_eq!(events[0].1["idv"], json!(true));
        assert_eq!(events[0].1["finish_profile"], json!(false));
        assert_eq!(events[0].1["success"], json!(false));
        assert_eq!(
            events[0].1["next_step"],
            json!(RedirectTarget::IdentityVerification.path())
        );
    }

    #[test]
    fn sso_event_for_issued_assertion_has_no_next_step() {
        let sink = CapturingAnalytics::default();
        let request = SamlRequest {
            id: "_req-2".to_string(),
            issuer: "https://sp.example.com".to_string(),
            acs_url: "https://sp.example.com/acs".to_string(),
            name_id_format: None,
            authn_context: None,
            relay_state: None,
        };

        record_sso_event(&sink, &request, false, false, Some(BridgeDecision::Assertion));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["success"], json!(true));
        assert_eq!(events[0].1["next_step"], json!(null));
    }
}
