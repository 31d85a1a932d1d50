//! API handlers and shared utilities.
//!
//! This module organizes the service's route handlers and provides the shared
//! IdP state plus small helpers for session cookies and the Content-Security-
//! Policy applied to POST-binding pages.

pub mod health;
pub mod recovery;
pub mod saml;

use axum::http::{HeaderMap, HeaderValue, header::COOKIE};

use crate::saml::{IdpConfig, SamlSigner, SpRegistry};
use crate::session;

/// Name of the browser session cookie. The value is opaque; storage is keyed
/// by its hash.
pub const SESSION_COOKIE: &str = "attesta_session";

/// Immutable IdP state shared by the SAML handlers.
pub struct BridgeState {
    pub signer: SamlSigner,
    pub idp: IdpConfig,
    pub registry: SpRegistry,
    /// Base URL of the account UI the bridge redirects into.
    pub frontend_base_url: String,
}

impl BridgeState {
    /// Absolute URL of an account-UI path.
    #[must_use]
    pub fn frontend_url(&self, path: &str) -> String {
        format!(
            "{}{path}",
            self.frontend_base_url.trim_end_matches('/')
        )
    }
}

/// Extract the session storage key from the request cookies, if present.
#[must_use]
pub fn session_hash(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(session::hash_token(value))
        } else {
            None
        }
    })
}

/// CSP for an auto-submitting POST-binding page: the form may only submit to
/// the message's destination origin, nothing else loads.
#[must_use]
pub fn post_binding_csp(form_action_origin: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "default-src 'none'; script-src 'unsafe-inline'; form-action {form_action_origin}"
    ))
    .ok()
}
