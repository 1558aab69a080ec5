use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use school_fees_core::{Fee, FeeDetail, FeeId, FeeStatus, PaymentFilter, StudentId};

use crate::payments::{list_payments, PaymentError};
use crate::{
    format_date, is_constraint, parse_decimal, to_rfc3339, RowDecodeError,
    SQLITE_CONSTRAINT_FOREIGNKEY,
};

pub(crate) const FEE_COLUMNS: &str =
    "id, student_id, fee_type, amount, due_date, status, created_at, updated_at";

/// Repository for the fee ledger.
#[derive(Clone)]
pub struct FeeRepository {
    pool: SqlitePool,
}

impl FeeRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Assigns a new outstanding fee to a student.
    pub async fn insert(&self, record: &NewFee<'_>) -> Result<Fee, FeeError> {
        let created_at = to_rfc3339(record.created_at);
        let row = sqlx::query_as::<_, FeeRow>(&format!(
            "INSERT INTO fees (student_id, fee_type, amount, due_date, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'outstanding', ?, ?) \
             RETURNING {FEE_COLUMNS}"
        ))
        .bind(record.student_id)
        .bind(record.fee_type)
        .bind(record.amount.to_string())
        .bind(format_date(record.due_date))
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_constraint(&err, SQLITE_CONSTRAINT_FOREIGNKEY) {
                FeeError::StudentNotFound(record.student_id)
            } else {
                FeeError::Database(err)
            }
        })?;

        Ok(row.into_domain()?)
    }

    /// Lists fees ordered by due date, oldest obligation first.
    pub async fn list(&self, query: &FeeQuery) -> Result<Vec<Fee>, FeeError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {FEE_COLUMNS} FROM fees WHERE 1 = 1"));
        if let Some(student_id) = query.student_id {
            builder.push(" AND student_id = ").push_bind(student_id);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY due_date ASC, id ASC");

        let rows = builder
            .build_query_as::<FeeRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(FeeError::from))
            .collect()
    }

    /// Loads a fee together with every payment attempt made against it.
    ///
    /// Both reads share one transaction so a verification committing in
    /// between cannot pair an outstanding fee with a verified payment.
    pub async fn fetch_detail(&self, id: FeeId) -> Result<FeeDetail, FeeError> {
        let mut tx = self.pool.begin().await?;

        let fee = sqlx::query_as::<_, FeeRow>(&format!(
            "SELECT {FEE_COLUMNS} FROM fees WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(FeeError::NotFound)?
        .into_domain()?;

        let payments = list_payments(
            &mut tx,
            &PaymentFilter {
                fee_id: Some(id),
                ..PaymentFilter::default()
            },
        )
        .await
        .map_err(|err| FeeError::Payments(Box::new(err)))?;
        tx.commit().await?;

        Ok(FeeDetail { fee, payments })
    }
}

/// Filters for [`FeeRepository::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeQuery {
    pub student_id: Option<StudentId>,
    pub status: Option<FeeStatus>,
}

/// Data required to assign a fee.
pub struct NewFee<'a> {
    pub student_id: StudentId,
    pub fee_type: &'a str,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeeRow {
    id: i64,
    student_id: i64,
    fee_type: String,
    amount: String,
    due_date: NaiveDate,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FeeRow {
    pub(crate) fn into_domain(self) -> Result<Fee, RowDecodeError> {
        Ok(Fee {
            id: self.id,
            student_id: self.student_id,
            fee_type: self.fee_type,
            amount: parse_decimal("fees.amount", self.amount)?,
            due_date: self.due_date,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Error)]
pub enum FeeError {
    #[error("fee not found")]
    NotFound,
    #[error("student {0} does not exist")]
    StudentNotFound(StudentId),
    #[error("failed to decode fee row: {0}")]
    Decode(#[from] RowDecodeError),
    #[error("failed to load payments for fee: {0}")]
    Payments(Box<PaymentError>),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
