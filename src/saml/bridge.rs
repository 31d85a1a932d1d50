//! Authentication bridge decisions.
//!
//! Flow Overview:
//! An inbound AuthnRequest does not get an assertion just because a session
//! exists. The bridge looks at the session principal and decides, in a fixed
//! order, whether the user must first finish something in the account UI:
//!
//! 1. credential completion - the session is not fully authenticated
//! 2. identity verification - the SP requires a verified identity the user
//!    lacks, and no profile finish is pending
//! 3. profile finish - a profile is still pending activation; this outranks
//!    the verification redirect because verification already happened
//! 4. attribute disclosure - the user has not yet seen what will be shared
//!
//! Only when none of these apply is a signed assertion produced. Each redirect
//! target preserves the pending request so the flow can resume.
//!
//! Security boundaries: the disclosure step must be recorded durably before
//! the user is redirected to it, otherwise a crash would show it twice.
//! Recording is the caller's job; the bridge is a pure function of its inputs.

use crate::profile::ProfileState;
use crate::session::{Principal, VerificationStatus};

/// Where to send the user when the bridge cannot issue an assertion yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RedirectTarget {
    CompleteCredentials,
    IdentityVerification,
    ProfileFinish,
    AttributeDisclosure,
}

impl RedirectTarget {
    /// Path within the account UI, relative to the frontend base URL.
    #[must_use]
    pub fn path(&self) -> &'static str {
        match self {
            Self::CompleteCredentials => "/login/two_factor",
            Self::IdentityVerification => "/verify",
            Self::ProfileFinish => "/verify/finish",
            Self::AttributeDisclosure => "/sign_up/completed",
        }
    }
}

/// The bridge's verdict for one evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BridgeDecision {
    Redirect(RedirectTarget),
    Assertion,
}

/// What this request demands beyond plain authentication.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestDemands {
    /// The SP asked for a verified-identity assertion.
    pub identity_verification: bool,
}

/// Evaluate the decision ladder for one request against one principal.
///
/// The order is load-bearing: a user who needs both identity verification and
/// the disclosure screen is sent to verification first, and sees disclosure
/// only once everything upstream is settled.
#[must_use]
pub fn evaluate_authentication(principal: &Principal, demands: &RequestDemands) -> BridgeDecision {
    if !principal.fully_authenticated {
        return BridgeDecision::Redirect(RedirectTarget::CompleteCredentials);
    }

    if demands.identity_verification
        && needs_identity_verification(principal)
        && !needs_profile_finish(principal)
    {
        return BridgeDecision::Redirect(RedirectTarget::IdentityVerification);
    }

    if needs_profile_finish(principal) {
        return BridgeDecision::Redirect(RedirectTarget::ProfileFinish);
    }

    if !principal.attribute_disclosure_shown {
        return BridgeDecision::Redirect(RedirectTarget::AttributeDisclosure);
    }

    BridgeDecision::Assertion
}

/// Verified means both halves hold: the user's verification finished and an
/// active profile carries the verified attributes.
pub(crate) fn needs_identity_verification(principal: &Principal) -> bool {
    !(principal.verification == VerificationStatus::Verified
        && principal.profile == Some(ProfileState::Active))
}

/// A pending profile blocks issuance even for requests that did not ask for
/// verified identity, and it outranks the verification redirect: the user
/// already went through verification and must land on the finish screen.
pub(crate) fn needs_profile_finish(principal: &Principal) -> bool {
    principal.profile == Some(ProfileState::VerificationPending)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{BridgeDecision, RedirectTarget, RequestDemands, evaluate_authentication};
    use crate::profile::ProfileState;
    use crate::session::{Principal, VerificationStatus};

    fn settled_principal() -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            fully_authenticated: true,
            verification: VerificationStatus::Verified,
            profile: Some(ProfileState::Active),
            attribute_disclosure_shown: true,
            branded_experience: None,
        }
    }

    fn ial2() -> RequestDemands {
        RequestDemands {
            identity_verification: true,
        }
    }

    #[test]
    fn settled_principal_gets_assertion() {
        let decision = evaluate_authentication(&settled_principal(), &ial2());
        assert_eq!(decision, BridgeDecision::Assertion);
    }

    #[test]
    fn partial_authentication_blocks_everything_else() {
        let principal = Principal {
            fully_authenticated: false,
            attribute_disclosure_shown: false,
            verification: VerificationStatus::Unverified,
            profile: None,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::CompleteCredentials)
        );
    }

    #[test]
    fn unverified_user_sent_to_verification_when_demanded() {
        let principal = Principal {
            verification: VerificationStatus::Unverified,
            profile: None,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::IdentityVerification)
        );
    }

    #[test]
    fn verified_status_without_active_profile_still_needs_verification() {
        let principal = Principal {
            verification: VerificationStatus::Verified,
            profile: None,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::IdentityVerification)
        );
    }

    #[test]
    fn unverified_user_passes_when_not_demanded() {
        let principal = Principal {
            verification: VerificationStatus::Unverified,
            profile: None,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &RequestDemands::default()),
            BridgeDecision::Assertion
        );
    }

    #[test]
    fn pending_profile_goes_to_finish_even_without_demand() {
        let principal = Principal {
            verification: VerificationStatus::Pending,
            profile: Some(ProfileState::VerificationPending),
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &RequestDemands::default()),
            BridgeDecision::Redirect(RedirectTarget::ProfileFinish)
        );
    }

    #[test]
    fn profile_finish_outranks_verification_when_both_needed() {
        // A pending profile means verification already happened; the user is
        // sent to the finish screen even when the request demands verified
        // identity, never back into verification.
        let principal = Principal {
            verification: VerificationStatus::Pending,
            profile: Some(ProfileState::VerificationPending),
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::ProfileFinish)
        );
    }

    #[test]
    fn pending_branding_never_blocks_issuance() {
        // Branding is stripped at issuance time; it is not a redirect step.
        let principal = Principal {
            branded_experience: Some("sp-a".to_string()),
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Assertion
        );
    }

    #[test]
    fn disclosure_comes_last() {
        let principal = Principal {
            attribute_disclosure_shown: false,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::AttributeDisclosure)
        );

        // Disclosure never preempts verification.
        let principal = Principal {
            attribute_disclosure_shown: false,
            verification: VerificationStatus::Unverified,
            profile: None,
            ..settled_principal()
        };
        assert_eq!(
            evaluate_authentication(&principal, &ial2()),
            BridgeDecision::Redirect(RedirectTarget::IdentityVerification)
        );
    }
}
