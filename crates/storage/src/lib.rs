mod activity;
mod fees;
mod payments;
mod reports;
mod students;

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

use school_fees_core::UnknownVariant;

pub use activity::{ActivityLogError, ActivityLogRepository, NewActivity};
pub use fees::{FeeError, FeeQuery, FeeRepository, NewFee};
pub use payments::{
    NewPaymentRecord, PaymentError, PaymentRepository, SubmitOutcome, Verification,
    VerificationOutcome,
};
pub use reports::{ReportError, ReportRepository};
pub use students::{NewStudent, StudentError, StudentRepository};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading and registering students.
    pub fn students(&self) -> StudentRepository {
        StudentRepository::new(self.pool.clone())
    }

    /// Returns a handle to the fee ledger.
    pub fn fees(&self) -> FeeRepository {
        FeeRepository::new(self.pool.clone())
    }

    /// Returns a handle for submitting, listing and verifying payments.
    pub fn payments(&self) -> PaymentRepository {
        PaymentRepository::new(self.pool.clone())
    }

    /// Returns a handle to the activity log backing change notifications.
    pub fn activity_log(&self) -> ActivityLogRepository {
        ActivityLogRepository::new(self.pool.clone())
    }

    /// Returns a handle for aggregate ledger figures.
    pub fn reports(&self) -> ReportRepository {
        ReportRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted row could not be mapped back into a domain value.
#[derive(Debug, Error)]
pub enum RowDecodeError {
    #[error("column {column} holds an invalid decimal '{value}': {source}")]
    Decimal {
        column: &'static str,
        value: String,
        source: rust_decimal::Error,
    },
    #[error(transparent)]
    Variant(#[from] UnknownVariant),
}

const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";

fn is_constraint(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(code),
        _ => false,
    }
}

fn parse_decimal(column: &'static str, value: String) -> Result<Decimal, RowDecodeError> {
    Decimal::from_str(&value).map_err(|source| RowDecodeError::Decimal {
        column,
        value,
        source,
    })
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    pub fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    pub fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("date")
    }

    /// Inserts a student and an outstanding fee, returning `(student_id, fee_id)`.
    pub async fn seed_fee(db: &Database, student_number: &str, amount: Decimal) -> (i64, i64) {
        let student = db
            .students()
            .insert(&NewStudent {
                student_number,
                full_name: "Ana Santos",
                grade_level: Some("Grade 4"),
                created_at: at("2024-01-01T00:00:00Z"),
            })
            .await
            .expect("insert student");
        let fee = db
            .fees()
            .insert(&NewFee {
                student_id: student.id,
                fee_type: "tuition",
                amount,
                due_date: day("2024-07-01"),
                created_at: at("2024-01-01T00:00:00Z"),
            })
            .await
            .expect("insert fee");
        (student.id, fee.id)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('students', 'fees', 'payments', 'activity_log')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 4, "expected ledger tables to be created");
    }

    #[tokio::test]
    async fn pools_are_isolated_between_connections() {
        let first = setup_db().await;
        seed_fee(&first, "S-1", rust_decimal::Decimal::ONE_HUNDRED).await;

        let second = setup_db().await;
        let count = second.students().count().await.expect("count");
        assert_eq!(count, 0);
    }
}
