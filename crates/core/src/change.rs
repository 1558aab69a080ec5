//! Typed change notifications and the query keys they invalidate.
//!
//! Every committed mutation produces a [`ChangeEvent`]. Readers that cache
//! results identify each read with a [`QueryKey`] and drop the entries whose
//! scope the event touches, refetching on next access instead of patching
//! cached values in place.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    FeeId, FeeStatus, Payment, PaymentId, PaymentStatus, StudentId, UnknownVariant,
};
use crate::workflow::VerificationDecision;

/// SSE event name telling a subscriber that replay was cut short and cached reads must be dropped.
pub const RESYNC_EVENT: &str = "resync";

/// Collection a subscriber can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Fees,
    Payments,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Fees, Topic::Payments];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fees => "fees",
            Self::Payments => "payments",
        }
    }
}

impl FromStr for Topic {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fees" => Ok(Self::Fees),
            "payments" => Ok(Self::Payments),
            _ => Err(UnknownVariant {
                kind: "topic",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "payment.submitted")]
    PaymentSubmitted,
    #[serde(rename = "payment.verified")]
    PaymentVerified,
    #[serde(rename = "payment.rejected")]
    PaymentRejected,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaymentSubmitted => "payment.submitted",
            Self::PaymentVerified => "payment.verified",
            Self::PaymentRejected => "payment.rejected",
        }
    }

    pub fn from_decision(decision: VerificationDecision) -> Self {
        match decision {
            VerificationDecision::Verified => Self::PaymentVerified,
            VerificationDecision::Rejected => Self::PaymentRejected,
        }
    }

    /// Collections whose views go stale after this change.
    ///
    /// Fee views list payment attempts, so every payment mutation touches both.
    pub fn topics(self) -> &'static [Topic] {
        &Topic::ALL
    }
}

impl FromStr for ChangeKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "payment.submitted" => Ok(Self::PaymentSubmitted),
            "payment.verified" => Ok(Self::PaymentVerified),
            "payment.rejected" => Ok(Self::PaymentRejected),
            other => Err(UnknownVariant {
                kind: "change kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Records touched by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeScope {
    pub payment_id: PaymentId,
    pub fee_id: FeeId,
    pub student_id: StudentId,
}

impl ChangeScope {
    pub fn of(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id,
            fee_id: payment.fee_id,
            student_id: payment.student_id,
        }
    }
}

/// Notification emitted after a mutation commits. `version` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub version: u64,
    pub kind: ChangeKind,
    #[serde(flatten)]
    pub scope: ChangeScope,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn topics(&self) -> &'static [Topic] {
        self.kind.topics()
    }

    /// Returns `true` when the event belongs to at least one of the given topics.
    pub fn touches_any(&self, topics: &[Topic]) -> bool {
        self.topics().iter().any(|topic| topics.contains(topic))
    }
}

/// Status selector accepted by fee listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatusFilter {
    #[default]
    Outstanding,
    Paid,
    All,
}

impl FeeStatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Paid => "paid",
            Self::All => "all",
        }
    }

    pub fn status(self) -> Option<FeeStatus> {
        match self {
            Self::Outstanding => Some(FeeStatus::Outstanding),
            Self::Paid => Some(FeeStatus::Paid),
            Self::All => None,
        }
    }
}

/// Optional filters for payment listings; `None` means unfiltered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_id: Option<FeeId>,
}

impl PaymentFilter {
    /// The verifier queue.
    pub fn pending() -> Self {
        Self {
            status: Some(PaymentStatus::Pending),
            ..Self::default()
        }
    }
}

/// Identity of a cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Fees {
        student_id: Option<StudentId>,
        status: FeeStatusFilter,
    },
    Fee(FeeId),
    Payments(PaymentFilter),
    Payment(PaymentId),
    DashboardStatus,
}

impl QueryKey {
    /// Whether a change to the given records makes this read stale.
    pub fn is_invalidated_by(&self, scope: &ChangeScope) -> bool {
        match self {
            Self::Fees { student_id, .. } => matches_id(*student_id, scope.student_id),
            Self::Fee(id) => *id == scope.fee_id,
            Self::Payments(filter) => {
                matches_id(filter.student_id, scope.student_id)
                    && matches_id(filter.fee_id, scope.fee_id)
            }
            Self::Payment(id) => *id == scope.payment_id,
            Self::DashboardStatus => true,
        }
    }
}

fn matches_id(filter: Option<i64>, id: i64) -> bool {
    filter.map(|value| value == id).unwrap_or(true)
}
