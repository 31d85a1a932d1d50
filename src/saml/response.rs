//! Outbound SAML message construction.
//!
//! Messages are built as XML strings, signed, then delivered to the SP's
//! browser via an auto-submitting POST form. Signing follows the enveloped
//! pattern: the message is serialized without a signature, the signature is
//! computed over that serialization, and the signature block is inserted
//! before the final encoding.

use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs8::EncodePublicKey;
use uuid::Uuid;

use super::request::SamlRequest;
use super::signer::{RSA_SHA256_ALGORITHM, SamlSigner};

const ASSERTION_VALIDITY: i64 = 5 * 60;

/// Static identity of this IdP: who it claims to be and where its endpoints
/// live. Built once at startup from CLI configuration.
#[derive(Clone, Debug)]
pub struct IdpConfig {
    pub entity_id: String,
    pub sso_url: String,
    pub slo_url: String,
}

/// A signed, base64-encoded message plus the form field it travels in.
#[derive(Clone, Debug)]
pub struct SignedMessage {
    pub destination: String,
    pub field_name: &'static str,
    pub encoded: String,
    pub relay_state: Option<String>,
    /// Protocol message id, used to correlate logout responses.
    pub id: String,
}

fn message_id() -> String {
    format!("_id{}", Uuid::new_v4().simple())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Build and sign the assertion response for a settled authentication.
///
/// # Errors
/// Fails only if the signing key cannot serialize, which indicates broken
/// key material.
pub fn build_signed_response(
    signer: &SamlSigner,
    idp: &IdpConfig,
    request: &SamlRequest,
    name_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedMessage> {
    let response_id = message_id();
    let assertion_id = message_id();
    let issue_instant = timestamp(now);
    let not_on_or_after = timestamp(now + Duration::seconds(ASSERTION_VALIDITY));
    let name_id_format = request
        .name_id_format
        .clone()
        .unwrap_or_else(|| "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent".to_string());

    let assertion = format!(
        r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{assertion_id}" Version="2.0" IssueInstant="{issue_instant}"><saml:Issuer>{issuer}</saml:Issuer><saml:Subject><saml:NameID Format="{name_id_format}">{name_id}</saml:NameID><saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData InResponseTo="{in_response_to}" Recipient="{recipient}" NotOnOrAfter="{not_on_or_after}"/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{issue_instant}" NotOnOrAfter="{not_on_or_after}"><saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement AuthnInstant="{issue_instant}" SessionIndex="{assertion_id}"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement></saml:Assertion>"#,
        issuer = idp.entity_id,
        in_response_to = request.id,
        recipient = request.acs_url,
        audience = request.issuer,
    );

    let unsigned = format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{response_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}" InResponseTo="{in_response_to}"><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>{assertion}</samlp:Response>"#,
        destination = request.acs_url,
        in_response_to = request.id,
        issuer = idp.entity_id,
    );

    let signed = insert_signature(signer, &unsigned, &response_id)?;
    Ok(SignedMessage {
        destination: request.acs_url.clone(),
        field_name: "SAMLResponse",
        encoded: Base64::encode_string(signed.as_bytes()),
        relay_state: request.relay_state.clone(),
        id: response_id,
    })
}

/// Build and sign a LogoutRequest towards one federated SP.
///
/// # Errors
/// Fails only on broken signing-key material.
pub fn build_logout_request(
    signer: &SamlSigner,
    idp: &IdpConfig,
    sp_slo_url: &str,
    name_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedMessage> {
    let request_id = message_id();
    let unsigned = format!(
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{request_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID>{name_id}</saml:NameID></samlp:LogoutRequest>"#,
        issue_instant = timestamp(now),
        destination = sp_slo_url,
        issuer = idp.entity_id,
    );

    let signed = insert_signature(signer, &unsigned, &request_id)?;
    Ok(SignedMessage {
        destination: sp_slo_url.to_string(),
        field_name: "SAMLRequest",
        encoded: Base64::encode_string(signed.as_bytes()),
        relay_state: None,
        id: request_id,
    })
}

/// Build and sign the LogoutResponse answering an SP-initiated request.
///
/// # Errors
/// Fails only on broken signing-key material.
pub fn build_logout_response(
    signer: &SamlSigner,
    idp: &IdpConfig,
    sp_slo_url: &str,
    in_response_to: &str,
    now: DateTime<Utc>,
) -> Result<SignedMessage> {
    let response_id = message_id();
    let unsigned = format!(
        r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{response_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}" InResponseTo="{in_response_to}"><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:LogoutResponse>"#,
        issue_instant = timestamp(now),
        destination = sp_slo_url,
        issuer = idp.entity_id,
    );

    let signed = insert_signature(signer, &unsigned, &response_id)?;
    Ok(SignedMessage {
        destination: sp_slo_url.to_string(),
        field_name: "SAMLResponse",
        encoded: Base64::encode_string(signed.as_bytes()),
        relay_state: None,
        id: response_id,
    })
}

/// Sign `unsigned` and splice the signature block in after the Issuer
/// element, referencing `reference_id`.
fn insert_signature(signer: &SamlSigner, unsigned: &str, reference_id: &str) -> Result<String> {
    let signature_value = signer.sign_base64(unsigned.as_bytes());
    let certificate = signing_certificate(signer)?;
    let block = format!(
        r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:SignatureMethod Algorithm="{RSA_SHA256_ALGORITHM}"/><ds:Reference URI="#{reference_id}"/></ds:SignedInfo><ds:SignatureValue>{signature_value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"##,
    );

    let issuer_end = unsigned
        .find("</saml:Issuer>")
        .map(|at| at + "</saml:Issuer>".len())
        .context("serialized message has no Issuer")?;
    let mut signed = String::with_capacity(unsigned.len() + block.len());
    signed.push_str(&unsigned[..issuer_end]);
    signed.push_str(&block);
    signed.push_str(&unsigned[issuer_end..]);
    Ok(signed)
}

/// Base64 SPKI of the signing key, published in signature blocks and
/// metadata so SPs can pin it.
pub(crate) fn signing_certificate(signer: &SamlSigner) -> Result<String> {
    let der = signer
        .verifying_key()
        .as_ref()
        .to_public_key_der()
        .context("failed to serialize signing key")?;
    Ok(Base64::encode_string(der.as_bytes()))
}

/// Render the auto-submitting POST form that carries a message to its
/// destination. The caller pairs this with a CSP scoped to the destination.
#[must_use]
pub fn post_binding_form(message: &SignedMessage) -> String {
    let relay_state_field = message
        .relay_state
        .as_deref()
        .map(|relay_state| {
            format!(
                r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                escape_attribute(relay_state)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Redirecting…</title></head>
<body onload="document.forms[0].submit()">
<noscript><p>Continue to the service you were signing in to:</p></noscript>
<form method="post" action="{action}">
<input type="hidden" name="{field}" value="{value}"/>
{relay_state_field}<noscript><button type="submit">Continue</button></noscript>
</form>
</body>
</html>
"#,
        action = escape_attribute(&message.destination),
        field = message.field_name,
        value = escape_attribute(&message.encoded),
    )
}

/// `form-action` origin for the CSP header on a POST-binding page: scheme
/// plus host plus explicit port when present.
///
/// # Errors
/// Returns an error for unparsable or host-less destinations.
pub fn form_action_origin(destination: &str) -> Result<String> {
    let url = url::Url::parse(destination)
        .with_context(|| format!("invalid destination URL: {destination}"))?;
    let host = url
        .host_str()
        .context("destination URL has no host")?
        .to_string();
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use base64ct::{Base64, Encoding};
    use chrono::{TimeZone, Utc};

    use super::{
        IdpConfig, build_logout_request, build_logout_response, build_signed_response,
        form_action_origin, post_binding_form,
    };
    use crate::saml::request::SamlRequest;
    use crate::saml::signer::testing::test_signer;

    fn idp() -> IdpConfig {
        IdpConfig {
            entity_id: "https://idp.example.com".to_string(),
            sso_url: "https://idp.example.com/api/saml/auth".to_string(),
            slo_url: "https://idp.example.com/api/saml/logout".to_string(),
        }
    }

    fn request() -> SamlRequest {
        SamlRequest {
            id: "_req1".to_string(),
            issuer: "https://sp-a.example.com".to_string(),
            acs_url: "https://sp-a.example.com/saml/acs".to_string(),
            name_id_format: None,
            authn_context: None,
            relay_state: Some("state".to_string()),
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn response_carries_request_context() {
        let signer = test_signer();
        let message = build_signed_response(&signer, &idp(), &request(), "user-42", now()).unwrap();

        assert_eq!(message.destination, "https://sp-a.example.com/saml/acs");
        assert_eq!(message.field_name, "SAMLResponse");
        assert_eq!(message.relay_state.as_deref(), Some("state"));

        let xml = String::from_utf8(Base64::decode_vec(&message.encoded).unwrap()).unwrap();
        assert!(xml.contains(r#"InResponseTo="_req1""#));
        assert!(xml.contains("<saml:Audience>https://sp-a.example.com</saml:Audience>"));
        assert!(xml.contains(">user-42</saml:NameID>"));
        assert!(xml.contains(r#"IssueInstant="2026-01-02T03:04:05Z""#));
        assert!(xml.contains("<ds:SignatureValue>"));
        assert!(message.id.starts_with("_id"));
        assert!(xml.contains(&format!(r#"ID="{}""#, message.id)));
    }

    #[test]
    fn logout_request_names_the_subject() {
        let signer = test_signer();
        let message = build_logout_request(
            &signer,
            &idp(),
            "https://sp-a.example.com/saml/slo",
            "user-42",
            now(),
        )
        .unwrap();
        assert_eq!(message.field_name, "SAMLRequest");
        let xml = String::from_utf8(Base64::decode_vec(&message.encoded).unwrap()).unwrap();
        assert!(xml.contains("<saml:NameID>user-42</saml:NameID>"));
        assert!(xml.contains("<ds:Signature"));
    }

    #[test]
    fn logout_response_correlates_with_request() {
        let signer = test_signer();
        let message = build_logout_response(
            &signer,
            &idp(),
            "https://sp-a.example.com/saml/slo",
            "_their_req",
            now(),
        )
        .unwrap();
        let xml = String::from_utf8(Base64::decode_vec(&message.encoded).unwrap()).unwrap();
        assert!(xml.contains(r#"InResponseTo="_their_req""#));
        assert!(xml.contains("status:Success"));
    }

    #[test]
    fn post_form_targets_destination_and_autosubmits() {
        let signer = test_signer();
        let message = build_signed_response(&signer, &idp(), &request(), "user-42", now()).unwrap();
        let html = post_binding_form(&message);
        assert!(html.contains(r#"action="https://sp-a.example.com/saml/acs""#));
        assert!(html.contains(r#"name="SAMLResponse""#));
        assert!(html.contains(r#"name="RelayState" value="state""#));
        assert!(html.contains("document.forms[0].submit()"));
    }

    #[test]
    fn form_action_origin_strips_path_and_keeps_port() {
        assert_eq!(
            form_action_origin("https://sp-a.example.com/saml/acs").unwrap(),
            "https://sp-a.example.com"
        );
        assert_eq!(
            form_action_origin("http://localhost:3001/acs").unwrap(),
            "http://localhost:3001"
        );
        assert!(form_action_origin("not a url").is_err());
    }
}
