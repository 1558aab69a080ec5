use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PaymentStatus;

/// Outcome a verifier assigns to a pending payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationDecision {
    Verified,
    Rejected,
}

impl VerificationDecision {
    pub fn as_str(self) -> &'static str {
        self.target_status().as_str()
    }

    /// Status the payment ends up in once the decision is applied.
    pub fn target_status(self) -> PaymentStatus {
        match self {
            Self::Verified => PaymentStatus::Verified,
            Self::Rejected => PaymentStatus::Rejected,
        }
    }

    /// Whether applying the decision marks the payment's fee as paid.
    pub fn settles_fee(self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Body of a verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub status: VerificationDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PaymentStatus {
    /// Applies a verification decision. Only `pending` payments can move, and only once.
    pub fn transition(self, decision: VerificationDecision) -> Result<Self, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyFinalized { current: self });
        }
        Ok(decision.target_status())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("payment is already {current}")]
    AlreadyFinalized { current: PaymentStatus },
}
