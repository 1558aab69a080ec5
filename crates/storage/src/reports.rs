use sqlx::SqlitePool;
use thiserror::Error;

use school_fees_core::{DashboardStatus, FeeStatus, PaymentStatus};

use rust_decimal::Decimal;

use crate::activity::{ActivityLogError, ActivityLogRepository};
use crate::{parse_decimal, RowDecodeError};

/// Read-only aggregates over the ledger.
#[derive(Clone)]
pub struct ReportRepository {
    pool: SqlitePool,
}

impl ReportRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Computes the dashboard figures.
    ///
    /// Amounts are TEXT columns, so sums are taken in Rust to keep decimal precision.
    pub async fn dashboard_status(&self) -> Result<DashboardStatus, ReportError> {
        let mut status = DashboardStatus::default();

        let fees: Vec<(String, String)> = sqlx::query_as("SELECT status, amount FROM fees")
            .fetch_all(&self.pool)
            .await?;
        for (fee_status, amount) in fees {
            let amount = parse_decimal("fees.amount", amount)?;
            match fee_status.parse::<FeeStatus>().map_err(RowDecodeError::from)? {
                FeeStatus::Outstanding => {
                    status.outstanding_fees += 1;
                    status.outstanding_amount =
                        add_amount("outstanding", status.outstanding_amount, amount)?;
                }
                FeeStatus::Paid => status.paid_fees += 1,
            }
        }

        let payments: Vec<(String, String)> =
            sqlx::query_as("SELECT payment_status, amount_paid FROM payments")
                .fetch_all(&self.pool)
                .await?;
        for (payment_status, amount) in payments {
            let amount = parse_decimal("payments.amount_paid", amount)?;
            match payment_status
                .parse::<PaymentStatus>()
                .map_err(RowDecodeError::from)?
            {
                PaymentStatus::Pending => {
                    status.pending_payments += 1;
                    status.pending_amount = add_amount("pending", status.pending_amount, amount)?;
                }
                PaymentStatus::Verified => {
                    status.verified_payments += 1;
                    status.collected_amount =
                        add_amount("collected", status.collected_amount, amount)?;
                }
                PaymentStatus::Rejected => status.rejected_payments += 1,
            }
        }

        status.latest_version = ActivityLogRepository::new(self.pool.clone())
            .latest_version()
            .await?;

        status.outstanding_amount = status.outstanding_amount.normalize();
        status.pending_amount = status.pending_amount.normalize();
        status.collected_amount = status.collected_amount.normalize();
        Ok(status)
    }
}

fn add_amount(total: &'static str, sum: Decimal, amount: Decimal) -> Result<Decimal, ReportError> {
    sum.checked_add(amount).ok_or(ReportError::AmountOverflow(total))
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0} total exceeds the representable amount")]
    AmountOverflow(&'static str),
    #[error("activity log error: {0}")]
    Activity(#[from] ActivityLogError),
    #[error("failed to decode ledger row: {0}")]
    Decode(#[from] RowDecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, day, seed_fee, setup_db};
    use crate::{NewPaymentRecord, Verification};
    use rust_decimal::Decimal;
    use school_fees_core::{NewPayment, PaymentMethod, VerificationDecision};

    #[tokio::test]
    async fn empty_ledger_reports_zeroes() {
        let db = setup_db().await;
        let status = db.reports().dashboard_status().await.expect("status");
        assert_eq!(status, DashboardStatus::default());
    }

    #[tokio::test]
    async fn totals_follow_the_payment_lifecycle() {
        let db = setup_db().await;
        let (student_a, fee_a) = seed_fee(&db, "S-1", Decimal::new(50050, 2)).await;
        let (_student_b, _fee_b) = seed_fee(&db, "S-2", Decimal::new(25, 1)).await;

        let submitted = db
            .payments()
            .submit(&NewPaymentRecord {
                payment: &NewPayment {
                    fee_id: fee_a,
                    student_id: student_a,
                    amount_paid: Decimal::new(50050, 2),
                    payment_method: PaymentMethod::Cash,
                    payment_date: None,
                    reference_number: None,
                    receipt_url: None,
                    notes: None,
                },
                payment_date: day("2024-06-01"),
                recorded_by: None,
                created_at: at("2024-06-01T08:00:00Z"),
            })
            .await
            .expect("submit");

        let pending = db.reports().dashboard_status().await.expect("status");
        assert_eq!(pending.outstanding_fees, 2);
        assert_eq!(pending.outstanding_amount, Decimal::new(503, 0));
        assert_eq!(pending.pending_payments, 1);
        assert_eq!(pending.pending_amount, Decimal::new(50050, 2));

        let verified = db
            .payments()
            .verify(&Verification {
                payment_id: submitted.payment.id,
                decision: VerificationDecision::Verified,
                verified_by: "accounting-1",
                notes: Some("cash counted"),
                decided_at: at("2024-06-02T08:00:00Z"),
            })
            .await
            .expect("verify");

        let settled = db.reports().dashboard_status().await.expect("status");
        assert_eq!(settled.outstanding_fees, 1);
        assert_eq!(settled.paid_fees, 1);
        assert_eq!(settled.pending_payments, 0);
        assert_eq!(settled.verified_payments, 1);
        assert_eq!(settled.collected_amount, Decimal::new(50050, 2));
        assert_eq!(settled.latest_version, verified.event.version);
    }

    #[tokio::test]
    async fn overflowing_totals_are_an_error() {
        let db = setup_db().await;
        let (student_id, fee_id) = seed_fee(&db, "S-1", Decimal::ONE).await;
        let huge = NewPayment {
            fee_id,
            student_id,
            amount_paid: Decimal::MAX,
            payment_method: PaymentMethod::Cash,
            payment_date: None,
            reference_number: None,
            receipt_url: None,
            notes: None,
        };
        for _ in 0..2 {
            db.payments()
                .submit(&NewPaymentRecord {
                    payment: &huge,
                    payment_date: day("2024-06-01"),
                    recorded_by: None,
                    created_at: at("2024-06-01T08:00:00Z"),
                })
                .await
                .expect("submit");
        }

        let err = db.reports().dashboard_status().await.unwrap_err();
        assert!(matches!(err, ReportError::AmountOverflow("pending")));
    }
}
