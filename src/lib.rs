//! # Attesta (SAML IdP Bridge & Personal-Key Recovery)
//!
//! `attesta` is a SAML identity provider that bridges authenticated account
//! sessions to relying service providers, plus the recovery engine for the
//! personal key protecting a user's encrypted PII.
//!
//! ## Session Bridge
//!
//! An inbound `AuthnRequest` never earns an assertion just because a session
//! cookie exists. The bridge walks a fixed ladder first: credential
//! completion, identity verification (when the request demands it), profile
//! finish, and a one-time attribute-disclosure screen. Only a fully settled
//! session receives the signed assertion, delivered on an auto-submitting
//! POST form whose Content-Security-Policy pins the destination origin.
//!
//! ## Single Logout
//!
//! Logout is a small state machine: an SP-initiated request is answered with
//! a signed `LogoutResponse`; an IdP-initiated logout fans signed
//! `LogoutRequest`s out to every SP this session asserted to, one browser
//! round trip at a time, correlating returning responses by request id.
//!
//! ## Personal Key Recovery
//!
//! Profile PII is sealed under a key derived from a 16-character personal
//! key. Recovery verifies the submitted key by decrypting the envelope (all
//! failures collapse into one uniform error) and on success re-encrypts
//! under a fresh key with a version-guarded swap, so each personal key is
//! single use.

pub mod analytics;
pub mod api;
pub mod cli;
pub mod profile;
pub mod recovery;
pub mod saml;
pub mod session;
