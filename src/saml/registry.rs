//! Registered service providers.
//!
//! The registry is loaded once at startup from a JSON document and is the
//! authority for where assertions and logout messages may be sent. Inbound
//! messages from unregistered issuers are rejected before any business
//! decision is made.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rsa::pkcs1v15::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::signer;

/// One registered SP: where to post assertions, where to send logout
/// messages, and the key its redirect-binding signatures verify against.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceProvider {
    pub entity_id: String,
    pub acs_url: String,
    #[serde(default)]
    pub slo_url: Option<String>,
    #[serde(default)]
    pub certificate_pem: Option<String>,
}

impl ServiceProvider {
    /// Parsed verification key for this SP, if one is registered.
    ///
    /// # Errors
    /// Returns an error if the registered PEM does not parse.
    pub fn verifying_key(&self) -> Result<Option<VerifyingKey<Sha256>>> {
        match &self.certificate_pem {
            Some(pem) => {
                let key = signer::decode_public_key(pem)
                    .with_context(|| format!("invalid key for SP {}", self.entity_id))?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpRegistry {
    providers: HashMap<String, ServiceProvider>,
}

impl SpRegistry {
    /// Parse a registry from its JSON form: an array of providers.
    ///
    /// # Errors
    /// Returns an error on malformed JSON, duplicate entity ids, or invalid
    /// endpoint URLs.
    pub fn from_json(json: &str) -> Result<Self> {
        let providers: Vec<ServiceProvider> =
            serde_json::from_str(json).context("invalid SP registry JSON")?;

        let mut map = HashMap::with_capacity(providers.len());
        for sp in providers {
            url::Url::parse(&sp.acs_url)
                .with_context(|| format!("invalid ACS URL for SP {}", sp.entity_id))?;
            if let Some(slo_url) = &sp.slo_url {
                url::Url::parse(slo_url)
                    .with_context(|| format!("invalid SLO URL for SP {}", sp.entity_id))?;
            }
            if map.insert(sp.entity_id.clone(), sp).is_some() {
                return Err(anyhow::anyhow!("duplicate SP entity id in registry"));
            }
        }

        Ok(Self { providers: map })
    }

    /// Load the registry from a file path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read SP registry: {}", path.display()))?;
        Self::from_json(&json)
    }

    #[must_use]
    pub fn lookup(&self, entity_id: &str) -> Option<&ServiceProvider> {
        self.providers.get(entity_id)
    }

    /// Providers with a logout endpoint, in stable entity-id order.
    #[must_use]
    pub fn logout_capable(&self) -> Vec<&ServiceProvider> {
        let mut providers: Vec<&ServiceProvider> = self
            .providers
            .values()
            .filter(|sp| sp.slo_url.is_some())
            .collect();
        providers.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        providers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::SpRegistry;

    const REGISTRY: &str = r#"[
        {
            "entity_id": "https://sp-a.example.com",
            "acs_url": "https://sp-a.example.com/saml/acs",
            "slo_url": "https://sp-a.example.com/saml/slo"
        },
        {
            "entity_id": "https://sp-b.example.com",
            "acs_url": "https://sp-b.example.com/auth/consume"
        }
    ]"#;

    #[test]
    fn parses_and_looks_up_providers() {
        let registry = SpRegistry::from_json(REGISTRY).unwrap();
        assert_eq!(registry.len(), 2);
        let sp = registry.lookup("https://sp-a.example.com").unwrap();
        assert_eq!(sp.acs_url, "https://sp-a.example.com/saml/acs");
        assert!(registry.lookup("https://sp-c.example.com").is_none());
    }

    #[test]
    fn logout_capable_excludes_providers_without_slo() {
        let registry = SpRegistry::from_json(REGISTRY).unwrap();
        let capable = registry.logout_capable();
        assert_eq!(capable.len(), 1);
        assert_eq!(capable[0].entity_id, "https://sp-a.example.com");
    }

    #[test]
    fn rejects_duplicate_entity_ids() {
        let json = r#"[
            {"entity_id": "a", "acs_url": "https://a/acs"},
            {"entity_id": "a", "acs_url": "https://a/acs2"}
        ]"#;
        assert!(SpRegistry::from_json(json).is_err());
    }

    #[test]
    fn rejects_invalid_acs_url() {
        let json = r#"[{"entity_id": "a", "acs_url": "not a url"}]"#;
        assert!(SpRegistry::from_json(json).is_err());
    }
}
