//! Best-effort receiver verification
//!
//! Identity hints arrive in request headers and are untrusted. Checking one
//! produces a [`ReceiverCheck`] value rather than an error so the caller
//! decides whether a mismatch blocks the request.

use crate::store::EmailAssociation;

/// Outcome of comparing a receiver hint with a recorded association
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverCheck {
    /// Hint matches the recorded receiver
    Verified,
    /// Hint differs from the recorded receiver
    Mismatch { expected: String, provided: String },
    /// No hint supplied, or nothing recorded to compare against
    NoHint,
    /// Key has no recorded association
    NoAssociation,
}

impl ReceiverCheck {
    /// Whether this outcome is a mismatch
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ReceiverCheck::Mismatch { .. })
    }
}

/// Compare a receiver hint against an association
///
/// Emails are compared trimmed and case-insensitively.
pub fn check_receiver(
    association: Option<&EmailAssociation>,
    provided: Option<&str>,
) -> ReceiverCheck {
    let Some(association) = association else {
        return ReceiverCheck::NoAssociation;
    };
    let (Some(expected), Some(provided)) = (association.receiver_email.as_deref(), provided)
    else {
        return ReceiverCheck::NoHint;
    };

    if normalize_email(expected) == normalize_email(provided) {
        ReceiverCheck::Verified
    } else {
        ReceiverCheck::Mismatch {
            expected: expected.to_string(),
            provided: provided.to_string(),
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
