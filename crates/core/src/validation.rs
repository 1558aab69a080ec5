use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FeeId, PaymentMethod, StudentId};

/// Upper bound for receipt images accepted by the upload form.
pub const MAX_RECEIPT_BYTES: u64 = 5 * 1024 * 1024;

/// Largest amount, in whole currency units, a single payment may claim.
pub const MAX_PAYMENT_UNITS: i64 = 1_000_000_000;

/// Amounts are recorded to the cent.
pub const MAX_AMOUNT_SCALE: u32 = 2;

/// Payment claim submitted by a payer or recorded by staff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub fee_id: FeeId,
    pub student_id: StudentId,
    pub amount_paid: Decimal,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewPayment {
    /// Trims optional text fields and drops the ones left blank.
    pub fn normalized(self) -> Self {
        Self {
            reference_number: non_blank(self.reference_number),
            receipt_url: non_blank(self.receipt_url),
            notes: non_blank(self.notes),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        check_submission(
            self.amount_paid,
            self.payment_method,
            self.reference_number.as_deref(),
            self.receipt_url.is_some(),
        )
    }
}

/// Field rules shared by the server and by clients validating a form before sending it.
pub fn check_submission(
    amount_paid: Decimal,
    method: PaymentMethod,
    reference_number: Option<&str>,
    has_receipt: bool,
) -> Result<(), SubmissionError> {
    if amount_paid <= Decimal::ZERO {
        return Err(SubmissionError::NonPositiveAmount);
    }
    let max = Decimal::from(MAX_PAYMENT_UNITS);
    if amount_paid > max {
        return Err(SubmissionError::AmountTooLarge { max });
    }
    if amount_paid.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(SubmissionError::AmountPrecision);
    }

    if method.requires_proof() {
        let has_reference = reference_number
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if !has_reference {
            return Err(SubmissionError::MissingReferenceNumber);
        }
        if !has_receipt {
            return Err(SubmissionError::MissingReceipt);
        }
    }

    Ok(())
}

/// Checks a receipt file's declared content type and size against the upload ceiling.
pub fn validate_receipt_file(
    content_type: &str,
    size_bytes: u64,
    max_bytes: u64,
) -> Result<(), SubmissionError> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.strip_prefix("image/") {
        Some(subtype) if !subtype.is_empty() => {}
        _ => return Err(SubmissionError::ReceiptNotImage(content_type.to_string())),
    }

    if size_bytes == 0 {
        return Err(SubmissionError::EmptyReceipt);
    }
    if size_bytes > max_bytes {
        return Err(SubmissionError::ReceiptTooLarge {
            size_bytes,
            max_bytes,
        });
    }

    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Reasons a payment submission is refused before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("amount paid must be greater than zero")]
    NonPositiveAmount,
    #[error("amount paid may not exceed {max}")]
    AmountTooLarge { max: Decimal },
    #[error("amount paid may have at most {MAX_AMOUNT_SCALE} decimal places")]
    AmountPrecision,
    #[error("online payments require a reference number")]
    MissingReferenceNumber,
    #[error("online payments require a receipt image")]
    MissingReceipt,
    #[error("receipt must be an image (got '{0}')")]
    ReceiptNotImage(String),
    #[error("receipt file is empty")]
    EmptyReceipt,
    #[error("receipt is {size_bytes} bytes, the limit is {max_bytes} bytes")]
    ReceiptTooLarge { size_bytes: u64, max_bytes: u64 },
}

impl SubmissionError {
    /// Stable machine readable code used in problem responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NonPositiveAmount => "invalid_amount",
            Self::AmountTooLarge { .. } => "amount_too_large",
            Self::AmountPrecision => "invalid_amount_precision",
            Self::MissingReferenceNumber => "missing_reference_number",
            Self::MissingReceipt => "missing_receipt",
            Self::ReceiptNotImage(_) => "receipt_not_image",
            Self::EmptyReceipt => "empty_receipt",
            Self::ReceiptTooLarge { .. } => "receipt_too_large",
        }
    }
}
