//! Personal-key recovery engine.
//!
//! Validates a user-supplied recovery secret against a profile's encrypted
//! PII envelope and, on success, re-encrypts the PII under a fresh key,
//! invalidating the old secret.

pub mod crypto;
pub mod form;
pub mod personal_key;

pub use form::{NewSecretDisclosure, PersonalKeyForm, RecoveryError};
