use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StudentId = i64;
pub type FeeId = i64;
pub type PaymentId = i64;

/// Error returned when a persisted or user supplied enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A student enrolled at the school.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: StudentId,
    pub student_number: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_level: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Settlement state of a fee obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Outstanding,
    Paid,
}

impl FeeStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Paid => "paid",
        }
    }
}

impl FromStr for FeeStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "outstanding" => Ok(Self::Outstanding),
            "paid" => Ok(Self::Paid),
            other => Err(UnknownVariant::new("fee status", other)),
        }
    }
}

impl fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A billable obligation owed by a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub id: FeeId,
    pub student_id: StudentId,
    pub fee_type: String,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub status: FeeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fee together with every payment attempt recorded against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeDetail {
    #[serde(flatten)]
    pub fee: Fee,
    pub payments: Vec<Payment>,
}

/// How the payer settled (or promised to settle) the fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Online,
    PromissoryNote,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Online => "online",
            Self::PromissoryNote => "promissory_note",
        }
    }

    /// Online transfers must carry a reference number and a receipt image.
    pub fn requires_proof(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl FromStr for PaymentMethod {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cash" => Ok(Self::Cash),
            "online" => Ok(Self::Online),
            "promissory_note" => Ok(Self::PromissoryNote),
            other => Err(UnknownVariant::new("payment method", other)),
        }
    }
}

/// Verification state of a payment. `Verified` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Verified,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed settlement against a fee, subject to staff verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub fee_id: FeeId,
    pub student_id: StudentId,
    pub amount_paid: Decimal,
    pub payment_date: NaiveDate,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregated ledger figures backing the staff dashboard.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    pub outstanding_fees: u64,
    pub outstanding_amount: Decimal,
    pub paid_fees: u64,
    pub pending_payments: u64,
    pub pending_amount: Decimal,
    pub verified_payments: u64,
    pub rejected_payments: u64,
    pub collected_amount: Decimal,
    pub latest_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_method_round_trips_through_database_strings() {
        for method in [
            PaymentMethod::Cash,
            PaymentMethod::Online,
            PaymentMethod::PromissoryNote,
        ] {
            assert_eq!(method.as_str().parse::<PaymentMethod>(), Ok(method));
        }
        let err = "cheque".parse::<PaymentMethod>().unwrap_err();
        assert_eq!(err.to_string(), "unknown payment method 'cheque'");
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Verified.is_terminal());
        assert!(PaymentStatus::Rejected.is_terminal());
    }

    #[test]
    fn payment_serializes_camel_case_and_string_amounts() {
        let payment = Payment {
            id: 7,
            fee_id: 1,
            student_id: 3,
            amount_paid: Decimal::new(50000, 2),
            payment_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            payment_method: PaymentMethod::PromissoryNote,
            payment_status: PaymentStatus::Pending,
            reference_number: None,
            receipt_url: None,
            notes: Some("June tuition".to_string()),
            recorded_by: Some("staff-1".to_string()),
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            created_at: DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let value = serde_json::to_value(&payment).expect("serialize");
        assert_eq!(value["feeId"], json!(1));
        assert_eq!(value["amountPaid"], json!("500.00"));
        assert_eq!(value["paymentMethod"], json!("promissory_note"));
        assert_eq!(value["paymentStatus"], json!("pending"));
        assert!(value.get("verifiedBy").is_none());
    }

    #[test]
    fn fee_detail_flattens_fee_fields() {
        let value = json!({
            "id": 1,
            "studentId": 2,
            "feeType": "tuition",
            "amount": 500,
            "dueDate": "2024-07-01",
            "status": "outstanding",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
            "payments": []
        });
        let detail: FeeDetail = serde_json::from_value(value).expect("deserialize");
        assert_eq!(detail.fee.status, FeeStatus::Outstanding);
        assert_eq!(detail.fee.amount, Decimal::new(500, 0));
        assert!(detail.payments.is_empty());
    }
}
