use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;

use school_fees_core::{
    ChangeEvent, ChangeKind, ChangeScope, Fee, FeeId, FeeStatus, NewPayment, Payment, PaymentFilter,
    PaymentId, PaymentStatus, StudentId, TransitionError, VerificationDecision,
};

use crate::activity::{ActivityLogError, ActivityLogRepository, NewActivity};
use crate::fees::{FeeRow, FEE_COLUMNS};
use crate::{
    format_date, is_constraint, parse_decimal, to_rfc3339, RowDecodeError,
    SQLITE_CONSTRAINT_UNIQUE,
};

const PAYMENT_COLUMNS: &str = "id, fee_id, student_id, amount_paid, payment_date, payment_method, \
     payment_status, reference_number, receipt_url, notes, recorded_by, verified_by, verified_at, \
     verification_notes, created_at";

/// Repository for payment submissions and their verification.
#[derive(Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a pending payment against an outstanding fee.
    ///
    /// The fee must exist, belong to the same student and still be outstanding;
    /// the fee itself is left untouched. The insert and its activity record
    /// commit together.
    pub async fn submit(&self, record: &NewPaymentRecord<'_>) -> Result<SubmitOutcome, PaymentError> {
        let payment = record.payment;
        let created_at = to_rfc3339(record.created_at);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments \
             (fee_id, student_id, amount_paid, payment_date, payment_method, payment_status, \
              reference_number, receipt_url, notes, recorded_by, created_at) \
             SELECT f.id, f.student_id, ?, ?, ?, 'pending', ?, ?, ?, ?, ? \
               FROM fees AS f \
              WHERE f.id = ? AND f.student_id = ? AND f.status = 'outstanding' \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.amount_paid.to_string())
        .bind(format_date(record.payment_date))
        .bind(payment.payment_method.as_str())
        .bind(&payment.reference_number)
        .bind(&payment.receipt_url)
        .bind(&payment.notes)
        .bind(record.recorded_by)
        .bind(&created_at)
        .bind(payment.fee_id)
        .bind(payment.student_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            let err = explain_rejected_submission(&mut tx, payment).await?;
            tx.rollback().await?;
            return Err(err);
        };
        let payment = row.into_domain()?;

        let event = append_activity(
            &mut tx,
            ChangeKind::PaymentSubmitted,
            &payment,
            record.recorded_by,
            record.created_at,
        )
        .await?;
        tx.commit().await?;

        Ok(SubmitOutcome { payment, event })
    }

    pub async fn fetch(&self, id: PaymentId) -> Result<Payment, PaymentError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::NotFound)?;

        Ok(row.into_domain()?)
    }

    /// Lists payments matching the filter, newest first.
    pub async fn list(&self, filter: &PaymentFilter) -> Result<Vec<Payment>, PaymentError> {
        let mut conn = self.pool.acquire().await?;
        list_payments(&mut conn, filter).await
    }

    /// Moves a pending payment to `verified` or `rejected`.
    ///
    /// The status change is conditional on the row still being pending, so of
    /// two concurrent verifiers exactly one succeeds. Verifying also flips the
    /// fee to `paid`; if the fee was already settled by another payment the
    /// whole transaction is rolled back.
    pub async fn verify(
        &self,
        request: &Verification<'_>,
    ) -> Result<VerificationOutcome, PaymentError> {
        let target = request.decision.target_status();
        let decided_at = to_rfc3339(request.decided_at);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments \
                SET payment_status = ?, verified_by = ?, verified_at = ?, verification_notes = ? \
              WHERE id = ? AND payment_status = 'pending' \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(target.as_str())
        .bind(request.verified_by)
        .bind(&decided_at)
        .bind(request.notes)
        .bind(request.payment_id)
        .fetch_optional(&mut *tx)
        .await;

        let row = match updated {
            Ok(Some(row)) => row,
            Ok(None) => {
                let err = explain_rejected_transition(&mut tx, request).await?;
                tx.rollback().await?;
                return Err(err);
            }
            Err(err) if is_constraint(&err, SQLITE_CONSTRAINT_UNIQUE) => {
                tx.rollback().await?;
                return Err(PaymentError::FeeAlreadyPaid);
            }
            Err(err) => return Err(PaymentError::Database(err)),
        };
        let payment = row.into_domain()?;

        let fee_row = if request.decision.settles_fee() {
            let settled = sqlx::query_as::<_, FeeRow>(&format!(
                "UPDATE fees SET status = 'paid', updated_at = ? \
                  WHERE id = ? AND status = 'outstanding' \
                 RETURNING {FEE_COLUMNS}"
            ))
            .bind(&decided_at)
            .bind(payment.fee_id)
            .fetch_optional(&mut *tx)
            .await?;
            match settled {
                Some(row) => row,
                None => {
                    tx.rollback().await?;
                    return Err(PaymentError::FeeAlreadyPaid);
                }
            }
        } else {
            sqlx::query_as::<_, FeeRow>(&format!("SELECT {FEE_COLUMNS} FROM fees WHERE id = ?"))
                .bind(payment.fee_id)
                .fetch_one(&mut *tx)
                .await?
        };
        let fee = fee_row.into_domain()?;

        let event = append_activity(
            &mut tx,
            ChangeKind::from_decision(request.decision),
            &payment,
            Some(request.verified_by),
            request.decided_at,
        )
        .await?;
        tx.commit().await?;

        Ok(VerificationOutcome {
            payment,
            fee,
            event,
        })
    }
}

pub(crate) async fn list_payments(
    conn: &mut SqliteConnection,
    filter: &PaymentFilter,
) -> Result<Vec<Payment>, PaymentError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE 1 = 1"
    ));
    if let Some(status) = filter.status {
        builder.push(" AND payment_status = ").push_bind(status.as_str());
    }
    if let Some(student_id) = filter.student_id {
        builder.push(" AND student_id = ").push_bind(student_id);
    }
    if let Some(fee_id) = filter.fee_id {
        builder.push(" AND fee_id = ").push_bind(fee_id);
    }
    builder.push(" ORDER BY created_at DESC, id DESC");

    let rows = builder
        .build_query_as::<PaymentRow>()
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter()
        .map(|row| row.into_domain().map_err(PaymentError::from))
        .collect()
}

async fn append_activity(
    tx: &mut Transaction<'_, Sqlite>,
    kind: ChangeKind,
    payment: &Payment,
    actor: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ChangeEvent, PaymentError> {
    let scope = ChangeScope::of(payment);
    let version = ActivityLogRepository::append(
        tx,
        &NewActivity {
            kind,
            scope,
            actor,
            created_at: at,
        },
    )
    .await?;

    Ok(ChangeEvent {
        version,
        kind,
        scope,
        at,
    })
}

async fn explain_rejected_submission(
    tx: &mut Transaction<'_, Sqlite>,
    payment: &NewPayment,
) -> Result<PaymentError, PaymentError> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT student_id, status FROM fees WHERE id = ?")
            .bind(payment.fee_id)
            .fetch_optional(&mut **tx)
            .await?;

    let Some((fee_student_id, status)) = row else {
        return Ok(PaymentError::FeeNotFound(payment.fee_id));
    };
    if fee_student_id != payment.student_id {
        return Ok(PaymentError::StudentMismatch {
            fee_id: payment.fee_id,
            student_id: payment.student_id,
        });
    }
    let status: FeeStatus = status.parse().map_err(RowDecodeError::from)?;
    Ok(PaymentError::FeeNotOutstanding {
        fee_id: payment.fee_id,
        status,
    })
}

async fn explain_rejected_transition(
    tx: &mut Transaction<'_, Sqlite>,
    request: &Verification<'_>,
) -> Result<PaymentError, PaymentError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT payment_status FROM payments WHERE id = ?")
        .bind(request.payment_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some((status,)) = row else {
        return Ok(PaymentError::NotFound);
    };
    let current: PaymentStatus = status.parse().map_err(RowDecodeError::from)?;
    match current.transition(request.decision) {
        Err(err) => Ok(PaymentError::Transition(err)),
        Ok(_) => Ok(PaymentError::Database(sqlx::Error::RowNotFound)),
    }
}

/// Data required to persist a submitted payment.
pub struct NewPaymentRecord<'a> {
    pub payment: &'a NewPayment,
    pub payment_date: NaiveDate,
    pub recorded_by: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub payment: Payment,
    pub event: ChangeEvent,
}

/// A verifier's decision on a single payment.
pub struct Verification<'a> {
    pub payment_id: PaymentId,
    pub decision: VerificationDecision,
    pub verified_by: &'a str,
    pub notes: Option<&'a str>,
    pub decided_at: DateTime<Utc>,
}

/// Result of a successful verification.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub payment: Payment,
    pub fee: Fee,
    pub event: ChangeEvent,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    fee_id: i64,
    student_id: i64,
    amount_paid: String,
    payment_date: NaiveDate,
    payment_method: String,
    payment_status: String,
    reference_number: Option<String>,
    receipt_url: Option<String>,
    notes: Option<String>,
    recorded_by: Option<String>,
    verified_by: Option<String>,
    verified_at: Option<DateTime<Utc>>,
    verification_notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl PaymentRow {
    fn into_domain(self) -> Result<Payment, RowDecodeError> {
        Ok(Payment {
            id: self.id,
            fee_id: self.fee_id,
            student_id: self.student_id,
            amount_paid: parse_decimal("payments.amount_paid", self.amount_paid)?,
            payment_date: self.payment_date,
            payment_method: self.payment_method.parse()?,
            payment_status: self.payment_status.parse()?,
            reference_number: self.reference_number,
            receipt_url: self.receipt_url,
            notes: self.notes,
            recorded_by: self.recorded_by,
            verified_by: self.verified_by,
            verified_at: self.verified_at,
            verification_notes: self.verification_notes,
            created_at: self.created_at,
        })
    }
}

/// Errors produced by payment submission, lookup and verification.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("fee {0} does not exist")]
    FeeNotFound(FeeId),
    #[error("fee {fee_id} is {status}, only outstanding fees accept payments")]
    FeeNotOutstanding { fee_id: FeeId, status: FeeStatus },
    #[error("fee {fee_id} does not belong to student {student_id}")]
    StudentMismatch { fee_id: FeeId, student_id: StudentId },
    #[error("payment not found")]
    NotFound,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("fee is already settled by a verified payment")]
    FeeAlreadyPaid,
    #[error("failed to decode payment row: {0}")]
    Decode(#[from] RowDecodeError),
    #[error("activity log error: {0}")]
    Activity(#[from] ActivityLogError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
