use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_IDP_BASE_URL: &str = "idp-base-url";
pub const ARG_IDP_ENTITY_ID: &str = "idp-entity-id";
pub const ARG_IDP_KEY_PATH: &str = "idp-key-path";
pub const ARG_SP_REGISTRY: &str = "sp-registry";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_IDP_BASE_URL)
                .long(ARG_IDP_BASE_URL)
                .help("Public base URL of this IdP, used to build endpoint locations")
                .env("ATTESTA_IDP_BASE_URL")
                .default_value("https://idp.attesta.dev"),
        )
        .arg(
            Arg::new(ARG_IDP_ENTITY_ID)
                .long(ARG_IDP_ENTITY_ID)
                .help("SAML entity id of this IdP (defaults to <idp-base-url>/api/saml/metadata)")
                .env("ATTESTA_IDP_ENTITY_ID"),
        )
        .arg(
            Arg::new(ARG_IDP_KEY_PATH)
                .long(ARG_IDP_KEY_PATH)
                .help("Path to the RSA signing key (PKCS#8 or PKCS#1, PEM or DER)")
                .env("ATTESTA_IDP_KEY_PATH")
                .required(true),
        )
        .arg(
            Arg::new(ARG_SP_REGISTRY)
                .long(ARG_SP_REGISTRY)
                .help("Path to the registered service providers JSON file")
                .env("ATTESTA_SP_REGISTRY")
                .required(true),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Base URL of the account UI users are redirected into")
                .env("ATTESTA_FRONTEND_BASE_URL")
                .default_value("https://account.attesta.dev"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub base_url: String,
    pub entity_id: String,
    pub key_path: String,
    pub sp_registry_path: String,
    pub frontend_base_url: String,
}

impl Options {
    /// Extract the IdP options from parsed matches.
    ///
    /// # Errors
    /// Returns an error if a required argument is absent.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let base_url = matches
            .get_one::<String>(ARG_IDP_BASE_URL)
            .cloned()
            .context("missing required argument: --idp-base-url")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let entity_id = matches
            .get_one::<String>(ARG_IDP_ENTITY_ID)
            .cloned()
            .unwrap_or_else(|| format!("{base_url}/api/saml/metadata"));
        let key_path = matches
            .get_one::<String>(ARG_IDP_KEY_PATH)
            .cloned()
            .context("missing required argument: --idp-key-path")?;
        let sp_registry_path = matches
            .get_one::<String>(ARG_SP_REGISTRY)
            .cloned()
            .context("missing required argument: --sp-registry")?;
        let frontend_base_url = matches
            .get_one::<String>(ARG_FRONTEND_BASE_URL)
            .cloned()
            .context("missing required argument: --frontend-base-url")?;

        Ok(Self {
            base_url,
            entity_id,
            key_path,
            sp_registry_path,
            frontend_base_url,
        })
    }
}
