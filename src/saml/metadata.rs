//! IdP metadata document.
//!
//! Published at the metadata endpoint so SPs can configure themselves: entity
//! id, SSO and SLO endpoints for both bindings, and the signing key.

use anyhow::Result;

use super::response::{self, IdpConfig};
use super::signer::{RSA_SHA256_ALGORITHM, SamlSigner};

/// Render and sign the metadata XML for this IdP.
///
/// # Errors
/// Fails only on broken signing-key material.
pub fn signed_metadata(signer: &SamlSigner, idp: &IdpConfig) -> Result<String> {
    let certificate = response::signing_certificate(signer)?;

    let unsigned = format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{entity_id}"><md:IDPSSODescriptor WantAuthnRequestsSigned="false" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol"><md:KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor><md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{slo_url}"/><md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{slo_url}"/><md:NameIDFormat>urn:oasis:names:tc:SAML:2.0:nameid-format:persistent</md:NameIDFormat><md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{sso_url}"/><md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{sso_url}"/></md:IDPSSODescriptor></md:EntityDescriptor>"#,
        entity_id = idp.entity_id,
        sso_url = idp.sso_url,
        slo_url = idp.slo_url,
    );

    let signature_value = signer.sign_base64(unsigned.as_bytes());
    let block = format!(
        r#"<ds:Signature><ds:SignedInfo><ds:SignatureMethod Algorithm="{RSA_SHA256_ALGORITHM}"/></ds:SignedInfo><ds:SignatureValue>{signature_value}</ds:SignatureValue></ds:Signature>"#,
    );

    let descriptor_start = format!(r#"entityID="{}">"#, idp.entity_id);
    let insert_at = unsigned
        .find(&descriptor_start)
        .map(|at| at + descriptor_start.len())
        .unwrap_or(unsigned.len());
    let mut signed = String::with_capacity(unsigned.len() + block.len());
    signed.push_str(&unsigned[..insert_at]);
    signed.push_str(&block);
    signed.push_str(&unsigned[insert_at..]);
    Ok(signed)
}
