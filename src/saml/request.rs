//! Inbound SAML message decoding and validation.
//!
//! Redirect-binding payloads arrive base64-over-DEFLATE, POST-binding
//! payloads plain base64. Field extraction is deliberately shallow: only the
//! handful of protocol fields the bridge decides on are pulled out, and a
//! message is rejected unless its issuer is a registered service provider.
//! Redirect-binding signatures are verified over the reconstructed signed
//! query string, which is what the signature actually covers in that binding.

use std::io::Read;

use anyhow::{Context, Result, anyhow};
use base64ct::{Base64, Encoding};
use flate2::read::DeflateDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use rsa::pkcs1v15::VerifyingKey;
use sha2::Sha256;

use super::registry::{ServiceProvider, SpRegistry};
use super::signer::{self, RSA_SHA256_ALGORITHM, SignerError};

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Which binding carried the inbound message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SamlBinding {
    HttpRedirect,
    HttpPost,
}

/// A validated inbound AuthnRequest. Immutable once parsed.
#[derive(Clone, Debug)]
pub struct SamlRequest {
    pub id: String,
    pub issuer: String,
    pub acs_url: String,
    pub name_id_format: Option<String>,
    pub authn_context: Option<String>,
    pub relay_state: Option<String>,
}

impl SamlRequest {
    /// Whether the requested authentication context asks for a verified
    /// identity rather than plain credential authentication.
    #[must_use]
    pub fn requests_verified_identity(&self) -> bool {
        self.authn_context
            .as_deref()
            .is_some_and(|context| context.contains("/ial/2") || context.contains("ial2"))
    }
}

/// An inbound single-logout message, either direction.
#[derive(Clone, Debug)]
pub enum LogoutMessage {
    Request(LogoutRequest),
    Response(LogoutResponse),
}

impl LogoutMessage {
    #[must_use]
    pub fn issuer(&self) -> &str {
        match self {
            Self::Request(request) => &request.issuer,
            Self::Response(response) => &response.issuer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
}

#[derive(Clone, Debug)]
pub struct LogoutResponse {
    pub issuer: String,
    pub in_response_to: Option<String>,
    pub success: bool,
}

/// Raw redirect-binding query parameters as received.
#[derive(Clone, Debug, Default)]
pub struct RedirectParams {
    pub relay_state: Option<String>,
    pub sig_alg: Option<String>,
    pub signature: Option<String>,
}

static RE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bID="([^"]+)""#).expect("static regex"));
static RE_ISSUER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?Issuer[^>]*>\s*([^<]+?)\s*</").expect("static regex")
});
static RE_ACS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"AssertionConsumerServiceURL="([^"]+)""#).expect("static regex"));
static RE_NAME_ID_POLICY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(?:[A-Za-z0-9]+:)?NameIDPolicy[^>]*Format="([^"]+)""#).expect("static regex")
});
static RE_AUTHN_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?AuthnContextClassRef[^>]*>\s*([^<]+?)\s*</")
        .expect("static regex")
});
static RE_NAME_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?NameID[^>]*>\s*([^<]+?)\s*</").expect("static regex")
});
static RE_IN_RESPONSE_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bInResponseTo="([^"]+)""#).expect("static regex"));

/// Decode and validate an inbound AuthnRequest against the SP registry.
///
/// # Errors
/// Returns an error for undecodable payloads, missing protocol fields,
/// unregistered issuers, or an ACS URL that contradicts the registration.
pub fn parse_authn_request<'a>(
    encoded: &str,
    binding: SamlBinding,
    relay_state: Option<String>,
    registry: &'a SpRegistry,
) -> Result<(SamlRequest, &'a ServiceProvider)> {
    let xml = decode_message(encoded, binding)?;

    if !xml.contains("AuthnRequest") {
        return Err(anyhow!("not an AuthnRequest"));
    }

    let id = capture(&RE_ID, &xml).context("AuthnRequest is missing an ID")?;
    let issuer = capture(&RE_ISSUER, &xml).context("AuthnRequest is missing an Issuer")?;

    let sp = registry
        .lookup(&issuer)
        .ok_or_else(|| anyhow!("unknown service provider: {issuer}"))?;

    // The registered ACS URL is authoritative. A request may repeat it, but a
    // different value is treated as tampering.
    if let Some(requested_acs) = capture(&RE_ACS_URL, &xml) {
        if requested_acs != sp.acs_url {
            return Err(anyhow!("ACS URL does not match registration for {issuer}"));
        }
    }

    Ok((
        SamlRequest {
            id,
            issuer,
            acs_url: sp.acs_url.clone(),
            name_id_format: capture(&RE_NAME_ID_POLICY, &xml),
            authn_context: capture(&RE_AUTHN_CONTEXT, &xml),
            relay_state,
        },
        sp,
    ))
}

/// Decode an inbound logout message without classifying it.
///
/// # Errors
/// Returns an error for undecodable payloads or messages that are neither a
/// `LogoutRequest` nor a `LogoutResponse`; callers treat that as "no valid
/// request" and fall through to IdP-initiated logout.
pub fn parse_logout_message(encoded: &str, binding: SamlBinding) -> Result<LogoutMessage> {
    let xml = decode_message(encoded, binding)?;

    if xml.contains("LogoutRequest") {
        let id = capture(&RE_ID, &xml).context("LogoutRequest is missing an ID")?;
        let issuer = capture(&RE_ISSUER, &xml).context("LogoutRequest is missing an Issuer")?;
        let name_id = capture(&RE_NAME_ID, &xml).context("LogoutRequest is missing a NameID")?;
        return Ok(LogoutMessage::Request(LogoutRequest { id, issuer, name_id }));
    }

    if xml.contains("LogoutResponse") {
        let issuer = capture(&RE_ISSUER, &xml).context("LogoutResponse is missing an Issuer")?;
        return Ok(LogoutMessage::Response(LogoutResponse {
            issuer,
            in_response_to: capture(&RE_IN_RESPONSE_TO, &xml),
            success: xml.contains("status:Success"),
        }));
    }

    Err(anyhow!("not a logout message"))
}

/// Verify a redirect-binding signature for the given SP.
///
/// The signed payload is the query string as the SP built it:
/// `SAMLRequest=…[&RelayState=…]&SigAlg=…`, percent-encoded. Only RSA-SHA256
/// is accepted. An SP without a registered key cannot send signed redirects.
///
/// # Errors
/// Returns an error on a missing/unknown algorithm, missing signature,
/// missing registered key, or verification failure.
pub fn verify_redirect_signature(
    sp: &ServiceProvider,
    param_name: &str,
    encoded_message: &str,
    params: &RedirectParams,
) -> Result<()> {
    let sig_alg = params
        .sig_alg
        .as_deref()
        .ok_or_else(|| anyhow!("missing SigAlg"))?;
    if sig_alg != RSA_SHA256_ALGORITHM {
        return Err(anyhow!("unsupported signature algorithm: {sig_alg}"));
    }
    let signature = params
        .signature
        .as_deref()
        .ok_or_else(|| anyhow!("missing Signature"))?;
    let key: VerifyingKey<Sha256> = sp
        .verifying_key()?
        .ok_or_else(|| anyhow!("no key registered for SP {}", sp.entity_id))?;

    let signed = signed_query(param_name, encoded_message, params.relay_state.as_deref(), sig_alg);
    signer::verify_base64(&key, signed.as_bytes(), signature).map_err(|err| match err {
        SignerError::Base64 => anyhow!("signature is not valid base64"),
        _ => anyhow!("signature verification failed for SP {}", sp.entity_id),
    })
}

fn signed_query(
    param_name: &str,
    encoded_message: &str,
    relay_state: Option<&str>,
    sig_alg: &str,
) -> String {
    let mut query = format!("{param_name}={}", urlencoding::encode(encoded_message));
    if let Some(relay_state) = relay_state {
        query.push_str(&format!("&RelayState={}", urlencoding::encode(relay_state)));
    }
    query.push_str(&format!("&SigAlg={}", urlencoding::encode(sig_alg)));
    query
}

fn decode_message(encoded: &str, binding: SamlBinding) -> Result<String> {
    let compact: String = encoded.split_whitespace().collect();
    let raw = Base64::decode_vec(&compact).context("message is not valid base64")?;

    let bytes = match binding {
        SamlBinding::HttpPost => raw,
        SamlBinding::HttpRedirect => {
            // Read one byte past the limit so the length check below can fire.
            let mut decoder =
                DeflateDecoder::new(raw.as_slice()).take(MAX_MESSAGE_BYTES as u64 + 1);
            let mut inflated = Vec::new();
            match decoder.read_to_end(&mut inflated) {
                Ok(_) if inflated.starts_with(b"<") => inflated,
                // Not DEFLATE: a POST-binding payload replayed over GET.
                _ if raw.starts_with(b"<") => raw,
                _ => return Err(anyhow!("message is not valid DEFLATE")),
            }
        }
    };

    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(anyhow!("message exceeds size limit"));
    }

    String::from_utf8(bytes).context("message is not valid UTF-8")
}

fn capture(re: &Regex, xml: &str) -> Option<String> {
    re.captures(xml)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}
