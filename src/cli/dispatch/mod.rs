//! Command-line argument dispatch and server initialization.
//!
//! This module parses validated CLI arguments and maps them to the appropriate
//! action, such as starting the API server with its full configuration state.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::idp;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let idp_opts = idp::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        idp_base_url: idp_opts.base_url,
        idp_entity_id: idp_opts.entity_id,
        idp_key_path: idp_opts.key_path,
        sp_registry_path: idp_opts.sp_registry_path,
        frontend_base_url: idp_opts.frontend_base_url,
    }))
}
