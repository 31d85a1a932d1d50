//! RSA-SHA256 signing and verification for SAML messages.
//!
//! The IdP signs every outbound message (responses, logout requests and
//! responses, metadata) with its PKCS#1 v1.5 key. Service-provider signatures
//! on redirect-binding messages are verified against the key registered for
//! the issuing SP.

use base64ct::{Base64, Encoding};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{Keypair, SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

pub const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("invalid base64 encoding")]
    Base64,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Holds the IdP signing key pair.
pub struct SamlSigner {
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
}

impl SamlSigner {
    /// Build a signer from a PKCS#8 or PKCS#1 private key, PEM or DER.
    ///
    /// # Errors
    /// Returns `SignerError::KeyParse` if no format matches.
    pub fn from_pem_or_der(pem_or_der: &[u8]) -> Result<Self, SignerError> {
        let private_key = decode_private_key(pem_or_der)?;
        Ok(Self::from_private_key(private_key))
    }

    #[must_use]
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Sign `data` and return the base64 signature value.
    #[must_use]
    pub fn sign_base64(&self, data: &[u8]) -> String {
        let signature = self.signing_key.sign(data);
        Base64::encode_string(&signature.to_bytes())
    }

    /// The public half, used by tests and metadata consumers.
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey<Sha256> {
        &self.verifying_key
    }
}

/// Parse an SP's registered RSA public key (SPKI or PKCS#1, PEM).
///
/// # Errors
/// Returns `SignerError::KeyParse` if no format matches.
pub fn decode_public_key(pem: &str) -> Result<VerifyingKey<Sha256>, SignerError> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(VerifyingKey::<Sha256>::new(key));
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(VerifyingKey::<Sha256>::new(key));
    }
    Err(SignerError::KeyParse)
}

/// Verify a base64 signature over `data`.
///
/// # Errors
/// Returns `SignerError::Base64` for malformed encoding and
/// `SignerError::InvalidSignature` when verification fails.
pub fn verify_base64(
    key: &VerifyingKey<Sha256>,
    data: &[u8],
    signature_b64: &str,
) -> Result<(), SignerError> {
    let raw = Base64::decode_vec(signature_b64).map_err(|_| SignerError::Base64)?;
    let signature = Signature::try_from(raw.as_slice()).map_err(|_| SignerError::InvalidSignature)?;
    key.verify(data, &signature)
        .map_err(|_| SignerError::InvalidSignature)
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, SignerError> {
    if let Ok(s) = std::str::from_utf8(pem_or_der) {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(s) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(s) {
            return Ok(key);
        }
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(key);
    }

    Err(SignerError::KeyParse)
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rsa::pkcs8::EncodePublicKey;

    use super::testing::test_signer;
    use super::{SignerError, decode_public_key, verify_base64};

    #[test]
    fn sign_verify_round_trip() {
        let signer = test_signer();
        let signature = signer.sign_base64(b"SAMLResponse=abc&SigAlg=rsa-sha256");
        verify_base64(
            signer.verifying_key(),
            b"SAMLResponse=abc&SigAlg=rsa-sha256",
            &signature,
        )
        .unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signer = test_signer();
        let signature = signer.sign_base64(b"original");
        let err = verify_base64(signer.verifying_key(), b"tampered", &signature).unwrap_err();
        assert!(matches!(err, SignerError::InvalidSignature));
    }

    #[test]
    fn garbage_signature_is_a_base64_error() {
        let signer = test_signer();
        let err = verify_base64(signer.verifying_key(), b"data", "!!not-base64!!").unwrap_err();
        assert!(matches!(err, SignerError::Base64));
    }

    #[test]
    fn public_key_pem_round_trips() {
        let signer = test_signer();
        let pem = signer
            .verifying_key()
            .as_ref()
            .to_public_key_pem(Default::default())
            .unwrap();
        let verifying = decode_public_key(&pem).unwrap();
        let signature = signer.sign_base64(b"data");
        verify_base64(&verifying, b"data", &signature).unwrap();
    }

    #[test]
    fn invalid_key_material_rejected() {
        assert!(matches!(
            super::SamlSigner::from_pem_or_der(b"not a key"),
            Err(SignerError::KeyParse)
        ));
    }
}
