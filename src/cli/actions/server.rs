use crate::{
    analytics::TracingAnalytics,
    api,
    api::handlers::BridgeState,
    saml::{IdpConfig, SamlSigner, SpRegistry},
};
use anyhow::{Context, Result};
use std::{fs, sync::Arc};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub idp_base_url: String,
    pub idp_entity_id: String,
    pub idp_key_path: String,
    pub sp_registry_path: String,
    pub frontend_base_url: String,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing key or SP registry cannot be loaded, or
/// the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let key_material = fs::read(&args.idp_key_path)
        .with_context(|| format!("Failed to read signing key: {}", args.idp_key_path))?;
    let signer = SamlSigner::from_pem_or_der(&key_material)
        .map_err(|err| anyhow::anyhow!("Invalid signing key {}: {err}", args.idp_key_path))?;

    let registry = SpRegistry::from_file(&args.sp_registry_path)?;
    info!(
        service_providers = registry.len(),
        "Loaded SP registry from {}", args.sp_registry_path
    );

    let idp = IdpConfig {
        entity_id: args.idp_entity_id,
        sso_url: format!("{}/api/saml/auth", args.idp_base_url),
        slo_url: format!("{}/api/saml/logout", args.idp_base_url),
    };

    let state = BridgeState {
        signer,
        idp,
        registry,
        frontend_base_url: args.frontend_base_url,
    };

    api::new(args.port, args.dsn, state, Arc::new(TracingAnalytics)).await
}
