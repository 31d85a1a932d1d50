//! Single logout orchestration.
//!
//! Flow Overview:
//! A hit on the logout endpoint lands in one of four situations:
//!
//! 1. a LogoutResponse from an SP we fanned out to, with more still pending
//! 2. the last LogoutResponse, so the IdP session itself can finish
//! 3. a valid SP-initiated LogoutRequest, answered with a LogoutResponse
//! 4. no valid message at all: IdP-initiated, fan out to federated SPs
//!
//! Fan-out requests are built as a batch and delivered one at a time via the
//! browser; no acknowledgement is awaited. A returning LogoutResponse is
//! correlated by the request id it answers. The logout analytics event is
//! recorded exactly once per evaluation, before any message is built, so a
//! signing failure cannot suppress it.
//!
//! Security boundaries: only registered SPs may drive logout. A LogoutRequest
//! from an unknown issuer, or a LogoutResponse answering nothing we sent, is
//! treated as if no message arrived.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::analytics::{self, Analytics};

use super::registry::SpRegistry;
use super::request::LogoutMessage;
use super::response::{self, IdpConfig, SignedMessage};
use super::signer::SamlSigner;

/// Session-scoped logout state, loaded by the handler before evaluation.
#[derive(Clone, Debug, Default)]
pub struct SloContext {
    /// Subject identifier asserted to SPs during this session.
    pub name_id: Option<String>,
    /// Ids of LogoutRequests we sent and have not yet seen answered.
    pub pending_request_ids: Vec<String>,
    /// Entity ids of SPs this session produced assertions for.
    pub federated_sps: Vec<String>,
}

/// One fan-out step: a signed LogoutRequest awaiting delivery.
#[derive(Clone, Debug)]
pub struct PendingLogoutRequest {
    pub request_id: String,
    pub sp_entity_id: String,
    pub message: SignedMessage,
}

/// What the handler must do after an evaluation.
#[derive(Debug)]
pub enum LogoutOutcome {
    /// A response came back but other SPs are still pending; keep waiting.
    AwaitResponses { remaining: Vec<String> },
    /// Everything settled: terminate the IdP session, show the signed-out page.
    Finished,
    /// Valid SP-initiated request: terminate the session, deliver this answer.
    RespondToSp(SignedMessage),
    /// IdP-initiated with federated SPs: persist the ids, deliver each request.
    FanOut(Vec<PendingLogoutRequest>),
}

/// Coarse classification of the logout situation, derived before any side
/// effect. Kept separate from [`evaluate_logout`] so it can be tested alone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SloState {
    AwaitingResponse { answered_request_id: String },
    AwaitingIdpFinish,
    ValidRequestReceived { request_id: String, issuer: String },
    IdpInitiated,
}

#[must_use]
pub fn classify(
    context: &SloContext,
    inbound: Option<&LogoutMessage>,
    registry: &SpRegistry,
) -> SloState {
    match inbound {
        Some(LogoutMessage::Response(resp)) => {
            let answered = resp
                .in_response_to
                .as_deref()
                .filter(|id| context.pending_request_ids.iter().any(|pending| pending == id));
            match answered {
                Some(id) if context.pending_request_ids.len() == 1 => {
                    debug_assert_eq!(context.pending_request_ids[0], id);
                    SloState::AwaitingIdpFinish
                }
                Some(id) => SloState::AwaitingResponse {
                    answered_request_id: id.to_string(),
                },
                // A response answering nothing we sent carries no state.
                None => SloState::IdpInitiated,
            }
        }
        Some(LogoutMessage::Request(req)) => {
            if registry.lookup(&req.issuer).is_some() {
                SloState::ValidRequestReceived {
                    request_id: req.id.clone(),
                    issuer: req.issuer.clone(),
                }
            } else {
                SloState::IdpInitiated
            }
        }
        None => SloState::IdpInitiated,
    }
}

/// Run one logout evaluation and produce the handler's marching orders.
///
/// # Errors
/// Fails on signing problems or a registry entry that lost its SLO URL
/// between classification and building.
pub fn evaluate_logout(
    context: &SloContext,
    inbound: Option<&LogoutMessage>,
    signer: &SamlSigner,
    idp: &IdpConfig,
    registry: &SpRegistry,
    analytics: &dyn Analytics,
    now: DateTime<Utc>,
) -> Result<LogoutOutcome> {
    let state = classify(context, inbound, registry);

    let sp_initiated = matches!(state, SloState::ValidRequestReceived { .. });
    analytics.record(
        analytics::LOGOUT_INITIATED,
        json!({ "sp_initiated": sp_initiated, "oidc": false }),
    );

    match state {
        SloState::AwaitingResponse {
            answered_request_id,
        } => {
            let remaining = context
                .pending_request_ids
                .iter()
                .filter(|id| **id != answered_request_id)
                .cloned()
                .collect();
            Ok(LogoutOutcome::AwaitResponses { remaining })
        }
        SloState::AwaitingIdpFinish => Ok(LogoutOutcome::Finished),
        SloState::ValidRequestReceived { request_id, issuer } => {
            let sp = registry
                .lookup(&issuer)
                .context("issuer vanished from registry")?;
            let slo_url = sp
                .slo_url
                .as_deref()
                .with_context(|| format!("SP {issuer} has no SLO endpoint"))?;
            let message = response::build_logout_response(signer, idp, slo_url, &request_id, now)?;
            Ok(LogoutOutcome::RespondToSp(message))
        }
        SloState::IdpInitiated => {
            let name_id = match context.name_id.as_deref() {
                Some(name_id) => name_id,
                // Nothing was asserted to anyone; only the local session exists.
                None => return Ok(LogoutOutcome::Finished),
            };

            let mut requests = Vec::new();
            for sp in registry.logout_capable() {
                if !context.federated_sps.iter().any(|id| id == &sp.entity_id) {
                    continue;
                }
                let slo_url = sp.slo_url.as_deref().context("logout_capable invariant")?;
                let message = response::build_logout_request(signer, idp, slo_url, name_id, now)?;
                requests.push(PendingLogoutRequest {
                    request_id: message.id.clone(),
                    sp_entity_id: sp.entity_id.clone(),
                    message,
                });
            }

            if requests.is_empty() {
                Ok(LogoutOutcome::Finished)
            } else {
                Ok(LogoutOutcome::FanOut(requests))
            }
        }
    }
}
