//! SAML identity-provider core.
//!
//! `request` decodes and validates inbound messages, `bridge` decides whether
//! a session may receive an assertion, `response` builds and signs outbound
//! messages, `slo` orchestrates single logout, `metadata` publishes the IdP
//! descriptor, and `registry`/`signer` supply the trust material everything
//! else leans on.

pub mod bridge;
pub mod metadata;
pub mod registry;
pub mod request;
pub mod response;
pub mod signer;
pub mod slo;

pub use bridge::{BridgeDecision, RedirectTarget, RequestDemands, evaluate_authentication};
pub use registry::{ServiceProvider, SpRegistry};
pub use request::{LogoutMessage, RedirectParams, SamlBinding, SamlRequest};
pub use response::{IdpConfig, SignedMessage};
pub use signer::SamlSigner;
pub use slo::{LogoutOutcome, PendingLogoutRequest, SloContext};
